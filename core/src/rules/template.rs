// Template expansion for rule actions
// Single source of truth for all path templating: tokens ALWAYS resolve
// against the context's active artifact, never the original

use crate::rules::context::RuleContext;
use chrono::{DateTime, Local};
use serde_json::Value;
use std::path::PathBuf;

/// Expand a template pattern using the current active artifact
///
/// Recognized tokens:
/// - `{filename}`: full file name including extension
/// - `{stem}`: file name without extension
/// - `{ext}`: extension including the dot
/// - `{year}` `{month}` `{day}` `{hour}` `{minute}` `{second}`: from the
///   active file's mtime, falling back to now when the file does not exist
/// - any key from `ctx.vars`
///
/// Unknown tokens stay literal.
pub fn expand_template(pattern: &str, ctx: &RuleContext) -> String {
    let src = &ctx.active.path;

    let dt: DateTime<Local> = std::fs::metadata(src)
        .and_then(|m| m.modified())
        .map(DateTime::<Local>::from)
        .unwrap_or_else(|_| Local::now());

    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = ctx.active.ext.clone().unwrap_or_default();

    let mut out = pattern.to_string();
    let mut replace = |token: &str, value: &str| {
        let placeholder = format!("{{{}}}", token);
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, value);
        }
    };

    replace("filename", &ctx.active.file_name());
    replace("stem", &stem);
    replace("ext", &ext);
    replace("year", &dt.format("%Y").to_string());
    replace("month", &dt.format("%m").to_string());
    replace("day", &dt.format("%d").to_string());
    replace("hour", &dt.format("%H").to_string());
    replace("minute", &dt.format("%M").to_string());
    replace("second", &dt.format("%S").to_string());

    for (key, value) in &ctx.vars {
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        replace(key, &rendered);
    }

    out
}

/// Build a target path from a template
///
/// A trailing `/` means "directory": the active file name is appended.
pub fn build_target_path(template: &str, ctx: &RuleContext) -> PathBuf {
    let mut expanded = expand_template(template, ctx);
    if expanded.ends_with('/') {
        expanded.push_str(&ctx.active.file_name());
    }
    PathBuf::from(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::context::Artifact;
    use serde_json::json;

    fn ctx_with_active(original: &str, active: &str) -> RuleContext {
        let mut ctx = RuleContext::new(Artifact::new(original));
        ctx.update_active(Artifact::new(active));
        ctx
    }

    #[test]
    fn test_tokens_resolve_against_active_not_original() {
        // Post-remux: original .mkv, active .mov
        let ctx = ctx_with_active("/rec/clip.mkv", "/tmp/clip.mov");

        let result = expand_template("/editing/{year}/{month}/{filename}", &ctx);
        assert!(result.ends_with("clip.mov"));
        assert!(!result.contains(".mkv"));
        assert!(result.starts_with("/editing/"));
    }

    #[test]
    fn test_stem_and_ext_from_active() {
        let ctx = ctx_with_active("/recordings/clip.mkv", "/tmp/clip.mov");

        let result = expand_template("/output/{stem}_processed{ext}", &ctx);
        assert_eq!(result, "/output/clip_processed.mov");
    }

    #[test]
    fn test_filename_and_ext_identities() {
        let ctx = RuleContext::new(Artifact::new("/tmp/2025-09-01 11-47-07.mov"));

        assert_eq!(expand_template("{filename}", &ctx), "2025-09-01 11-47-07.mov");
        assert_eq!(expand_template("{ext}", &ctx), ".mov");
        assert_eq!(expand_template("{stem}", &ctx), "2025-09-01 11-47-07");
    }

    #[test]
    fn test_unknown_tokens_stay_literal() {
        let ctx = RuleContext::new(Artifact::new("/tmp/a.mov"));
        assert_eq!(expand_template("/out/{mystery}/{filename}", &ctx), "/out/{mystery}/a.mov");
    }

    #[test]
    fn test_user_vars_expand() {
        let mut ctx = RuleContext::new(Artifact::new("/tmp/a.mov"));
        ctx.vars.insert("game".into(), json!("factorio"));
        ctx.vars.insert("session".into(), json!(12));

        assert_eq!(
            expand_template("/archive/{game}/{session}/{filename}", &ctx),
            "/archive/factorio/12/a.mov"
        );
    }

    #[test]
    fn test_trailing_slash_appends_active_filename() {
        let ctx = ctx_with_active("/rec/clip.mkv", "/tmp/clip.mov");

        let target = build_target_path("/editing/raw/", &ctx);
        assert_eq!(target, PathBuf::from("/editing/raw/clip.mov"));
    }

    #[test]
    fn test_date_tokens_fall_back_to_now_for_missing_file() {
        let ctx = RuleContext::new(Artifact::new("/definitely/not/here.mov"));
        let result = expand_template("{year}-{month}-{day}", &ctx);

        // Shape check only: the fallback clock is "now"
        assert_eq!(result.len(), 10);
        assert_eq!(result.matches('-').count(), 2);
        assert!(result[..4].chars().all(|c| c.is_ascii_digit()));
    }
}
