//! Store package-identifier extraction from links and free text.

use once_cell::sync::Lazy;
use regex::Regex;

static PLAY_STORE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"play\.google\.com/store/apps/details\?(?:[^\s#]*&(?:amp;)?)?id=([A-Za-z][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)+)",
    )
    .expect("play store id pattern")
});

static APP_STORE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:apps|itunes)\.apple\.com/\S*?/id(\d+)").expect("app store id pattern")
});

/// Package identifier found in `text`: an Android package name from a Play Store
/// details link, else `ios-<digits>` from an App Store link.
pub fn extract_package_uid(text: &str) -> Option<String> {
    if let Some(caps) = PLAY_STORE_ID.captures(text) {
        return Some(caps[1].to_string());
    }
    APP_STORE_ID
        .captures(text)
        .map(|caps| format!("ios-{}", &caps[1]))
}

/// First identifier across `candidates`, tried in order (link before body text).
pub fn extract_package_uid_from<'a, I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    candidates
        .into_iter()
        .flatten()
        .find_map(extract_package_uid)
}
