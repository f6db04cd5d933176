use crate::layout::InstallScope;

/// One hour minus jitter, so agents across a fleet do not wake in lockstep.
pub const DEFAULT_START_INTERVAL: u32 = 3523;

const INSTALL_ROOT_TOKEN: &str = "${INSTALL_ROOT}";
const INSTALL_TYPE_TOKEN: &str = "${INSTALL_TYPE}";
const START_INTERVAL_TOKEN: &str = "${START_INTERVAL}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTokens<'a> {
    pub install_root: &'a str,
    pub scope: InstallScope,
    pub start_interval: u32,
}

pub fn render_job_descriptor(template: &str, tokens: &DescriptorTokens<'_>) -> String {
    let rendered = template
        .replace(INSTALL_ROOT_TOKEN, tokens.install_root)
        .replace(INSTALL_TYPE_TOKEN, tokens.scope.as_str())
        .replace(START_INTERVAL_TOKEN, &tokens.start_interval.to_string());
    collapse_doubled_separators(&rendered)
}

// `${INSTALL_ROOT}` carries a trailing separator, so `${INSTALL_ROOT}/Library`
// renders as `//Library`. A slash run directly after `:` is a URL scheme
// (`https://`, `file:///`) and is left whole.
fn collapse_doubled_separators(rendered: &str) -> String {
    let mut collapsed = String::with_capacity(rendered.len());
    let mut previous: Option<char> = None;
    let mut scheme_run = false;
    for ch in rendered.chars() {
        if ch == '/' {
            if previous == Some(':') {
                scheme_run = true;
            } else if previous == Some('/') && !scheme_run {
                continue;
            }
        } else {
            scheme_run = false;
        }
        collapsed.push(ch);
        previous = Some(ch);
    }
    collapsed
}
