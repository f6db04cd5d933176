use anyhow::{Context, Result};

use crate::version::BundleVersion;

pub const BUNDLE_VERSION_KEY: &str = "CFBundleVersion";

/// Reads a `<string>` value for `key` from XML property-list text.
///
/// Only the first occurrence of the key is considered. Returns `None` when the
/// key is missing or its value is not a string.
pub fn read_plist_string(raw: &str, key: &str) -> Option<String> {
    let key_tag = format!("<key>{key}</key>");
    let after_key = &raw[raw.find(&key_tag)? + key_tag.len()..];
    let value = after_key.trim_start();

    if value.starts_with("<string/>") {
        return Some(String::new());
    }
    let value = value.strip_prefix("<string>")?;
    let end = value.find("</string>")?;
    Some(unescape_xml(value[..end].trim()))
}

pub fn bundle_version_from_plist(raw: &str) -> Result<Option<BundleVersion>> {
    let Some(value) = read_plist_string(raw, BUNDLE_VERSION_KEY) else {
        return Ok(None);
    };
    let version = BundleVersion::parse(&value)
        .with_context(|| format!("invalid {BUNDLE_VERSION_KEY} value '{value}'"))?;
    Ok(Some(version))
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
