//! Upload filename policy.
//!
//! Names are reduced to a conservative ASCII subset before they touch the
//! filesystem, and only raster extensions the decoder understands are accepted.

use std::path::Path;

use uuid::Uuid;

/// Extensions accepted for upload (lower-case, without the dot).
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "tiff", "tif"];

/// Lower-cased extension of `name`, if any.
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Split `name` into its stem and lower-cased extension.
pub fn split_name(name: &str) -> (&str, Option<String>) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], Some(name[dot + 1..].to_ascii_lowercase())),
        _ => (name, None),
    }
}

/// Whether `name` carries an uploadable extension.
pub fn is_allowed(name: &str) -> bool {
    extension_of(name)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Reduce a client-supplied filename to a safe flat name.
///
/// Path components are dropped, whitespace becomes `_`, anything outside
/// `[A-Za-z0-9._-]` is removed and leading dots/underscores are stripped.
/// Returns an empty string when nothing usable remains.
pub fn sanitize_filename(raw: &str) -> String {
    let flat = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let joined = flat.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    kept.trim_start_matches(['.', '_']).to_string()
}

/// Sanitized name, or a generated `image_<hex>.png` when sanitizing leaves nothing.
pub fn sanitize_or_generate(raw: &str) -> String {
    let clean = sanitize_filename(raw);
    if clean.is_empty() {
        let token = Uuid::new_v4().simple().to_string();
        format!("image_{}.png", &token[..8])
    } else {
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_paths_and_unsafe_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\photos\\my cat.JPG"), "my_cat.JPG");
        assert_eq!(sanitize_filename("ümlaut-ß.png"), "mlaut-.png");
        assert_eq!(sanitize_filename("..hidden.png"), "hidden.png");
    }

    #[test]
    fn empty_names_get_generated_png() {
        let generated = sanitize_or_generate("///");
        assert!(generated.starts_with("image_"));
        assert!(generated.ends_with(".png"));
        assert_eq!(generated.len(), "image_".len() + 8 + ".png".len());
    }

    #[test]
    fn extension_policy_is_case_insensitive() {
        assert!(is_allowed("a.PNG"));
        assert!(is_allowed("b.tif"));
        assert!(!is_allowed("c.gif"));
        assert!(!is_allowed("noext"));
    }

    #[test]
    fn split_name_keeps_inner_dots() {
        assert_eq!(split_name("a.b.JPG"), ("a.b", Some("jpg".to_string())));
        assert_eq!(split_name("plain"), ("plain", None));
        assert_eq!(split_name(".png"), (".png", None));
    }
}
