use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const INTERRUPT: u8 = 0x03;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    #[default]
    None,
    Password,
    Sudo,
    Login,
    Confirm,
    Menu,
    Editor,
    Progress,
}

impl PromptKind {
    pub fn expects_input(self) -> bool {
        matches!(
            self,
            PromptKind::Password
                | PromptKind::Sudo
                | PromptKind::Login
                | PromptKind::Confirm
                | PromptKind::Menu
        )
    }

    pub fn is_credential(self) -> bool {
        matches!(
            self,
            PromptKind::Password | PromptKind::Sudo | PromptKind::Login
        )
    }

    pub fn masked(self) -> bool {
        matches!(self, PromptKind::Password | PromptKind::Sudo)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptDetail {
    Password {
        label: String,
    },
    Sudo {
        user: Option<String>,
    },
    Login,
    Confirm {
        options: Vec<String>,
        default: Option<String>,
    },
    Menu {
        options: Vec<String>,
    },
    Editor {
        program: Option<String>,
    },
    Progress {
        percent: Option<u8>,
    },
}

impl PromptDetail {
    pub fn kind(&self) -> PromptKind {
        match self {
            PromptDetail::Password { .. } => PromptKind::Password,
            PromptDetail::Sudo { .. } => PromptKind::Sudo,
            PromptDetail::Login => PromptKind::Login,
            PromptDetail::Confirm { .. } => PromptKind::Confirm,
            PromptDetail::Menu { .. } => PromptKind::Menu,
            PromptDetail::Editor { .. } => PromptKind::Editor,
            PromptDetail::Progress { .. } => PromptKind::Progress,
        }
    }

    pub fn options(&self) -> Vec<String> {
        match self {
            PromptDetail::Confirm { options, .. } | PromptDetail::Menu { options } => {
                options.clone()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub detail: PromptDetail,
    pub prompt_text: String,
    pub match_end: usize,
    pub match_start: usize,
}

impl Classification {
    pub fn kind(&self) -> PromptKind {
        self.detail.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptDescriptor {
    pub id: u64,
    pub kind: PromptKind,
    pub prompt_text: String,
    pub masked: bool,
    pub options: Vec<String>,
    pub timeout_seconds: u64,
    pub detail: PromptDetail,
}

impl PromptDescriptor {
    pub fn from_classification(id: u64, classification: &Classification, timeout_seconds: u64) -> Self {
        let kind = classification.kind();
        Self {
            id,
            kind,
            prompt_text: classification.prompt_text.clone(),
            masked: kind.masked(),
            options: classification.detail.options(),
            timeout_seconds,
            detail: classification.detail.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptResolution {
    Response(String),
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptOutcome {
    Answered,
    Cancelled,
    TimedOut,
}

impl From<&PromptResolution> for PromptOutcome {
    fn from(value: &PromptResolution) -> Self {
        match value {
            PromptResolution::Response(_) => PromptOutcome::Answered,
            PromptResolution::Cancelled => PromptOutcome::Cancelled,
            PromptResolution::TimedOut => PromptOutcome::TimedOut,
        }
    }
}

static SUDO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\[sudo\] password for (?P<user>[^:\s]+)|^sudo password|doas \((?P<doas>[^@)\s]+)@[^)]*\) password)\s*:\s*$")
        .expect("sudo pattern")
});
static PASSWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:password|passphrase|passwd|\bpin\b|verification code|one-time code)[^\n]*:\s*$")
        .expect("password pattern")
});
static LOGIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|\s)(?:login|username|user name)\s*:\s*$").expect("login pattern")
});
static CONFIRM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\[(](?P<opts>(?:yes|no|y|n)(?:/(?:yes|no|y|n|\[fingerprint\]))+)[\])]\s*[?:]?\s*$")
        .expect("confirm pattern")
});
static MENU_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#\?|.*\b(?:select|choose|choice|selection|option)\b.*[:?>])\s*$")
        .expect("menu prompt pattern")
});
static MENU_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[?(?P<num>\d{1,2})[\]).:]\s+(?P<label>\S.*?)\s*$").expect("menu entry pattern")
});
static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s\[(])(?P<pct>\d{1,3})(?:\.\d+)?%").expect("progress pattern")
});

const ALT_SCREEN_ENTER: &[&[u8]] = &[b"\x1b[?1049h", b"\x1b[?1047h", b"\x1b[?47h"];
const MENU_LOOKBACK_LINES: usize = 16;

pub fn classify_text(text: &str) -> Option<Classification> {
    let line_start = text.rfind('\n').map(|idx| idx + 1).unwrap_or(0);
    let line = &text[line_start..];
    // Overwritten lines keep only what follows the last carriage return.
    let segment_start = line_start + line.rfind('\r').map(|idx| idx + 1).unwrap_or(0);
    let segment = &text[segment_start..];
    let end = text.len();

    if !segment.trim().is_empty() {
        if let Some(found) = classify_input_line(segment) {
            return Some(Classification {
                detail: found,
                prompt_text: segment.trim().to_string(),
                match_end: end,
                match_start: segment_start,
            });
        }
        if MENU_PROMPT.is_match(segment)
            && let Some((options, menu_start)) = menu_options(text, line_start)
        {
            return Some(Classification {
                detail: PromptDetail::Menu { options },
                prompt_text: segment.trim().to_string(),
                match_end: end,
                match_start: menu_start,
            });
        }
    }

    progress(text).map(|(percent, start)| Classification {
        detail: PromptDetail::Progress {
            percent: Some(percent),
        },
        prompt_text: text[start..].trim().to_string(),
        match_end: end,
        match_start: start,
    })
}

fn classify_input_line(segment: &str) -> Option<PromptDetail> {
    if let Some(caps) = SUDO.captures(segment) {
        let user = caps
            .name("user")
            .or_else(|| caps.name("doas"))
            .map(|m| m.as_str().to_string());
        return Some(PromptDetail::Sudo { user });
    }
    if PASSWORD.is_match(segment) {
        let label = segment.trim().trim_end_matches(':').trim().to_string();
        return Some(PromptDetail::Password { label });
    }
    if LOGIN.is_match(segment) {
        return Some(PromptDetail::Login);
    }
    if let Some(caps) = CONFIRM.captures(segment) {
        let raw = caps.name("opts").map(|m| m.as_str()).unwrap_or_default();
        let mut options = Vec::new();
        let mut default = None;
        for part in raw.split('/') {
            let cleaned = part.trim_matches(|c| c == '[' || c == ']');
            if cleaned.len() == 1 && cleaned.chars().all(|c| c.is_ascii_uppercase()) {
                default = Some(cleaned.to_ascii_lowercase());
            }
            options.push(cleaned.to_ascii_lowercase());
        }
        return Some(PromptDetail::Confirm { options, default });
    }
    None
}

fn menu_options(text: &str, line_start: usize) -> Option<(Vec<String>, usize)> {
    let before = &text[..line_start];
    let mut options = Vec::new();
    let mut start = line_start;
    let mut offset = before.len();
    for line in before.trim_end_matches('\n').rsplit('\n').take(MENU_LOOKBACK_LINES) {
        offset = offset.saturating_sub(line.len() + 1);
        if line.trim().is_empty() {
            continue;
        }
        let Some(caps) = MENU_ENTRY.captures(line) else {
            break;
        };
        options.push(caps["label"].to_string());
        start = offset;
    }
    if options.len() < 2 {
        return None;
    }
    options.reverse();
    Some((options, start))
}

fn progress(text: &str) -> Option<(u8, usize)> {
    let trimmed = text.trim_end_matches(['\n', '\r', ' ']);
    let start = trimmed.rfind(['\n', '\r']).map(|idx| idx + 1).unwrap_or(0);
    let caps = PROGRESS.captures_iter(&trimmed[start..]).last()?;
    let percent: u16 = caps["pct"].parse().ok()?;
    (percent <= 100).then_some((percent as u8, start))
}

fn detect_editor(raw: &[u8], text: &str) -> Option<PromptDetail> {
    let entered = ALT_SCREEN_ENTER
        .iter()
        .any(|needle| raw.windows(needle.len()).any(|window| window == *needle));
    let banner = if text.contains("GNU nano") {
        Some("nano")
    } else if text.contains("VIM - Vi IMproved") {
        Some("vim")
    } else {
        None
    };
    if !entered && banner.is_none() {
        return None;
    }
    Some(PromptDetail::Editor {
        program: banner.map(str::to_string),
    })
}

#[derive(Debug)]
pub struct PromptClassifier {
    history: String,
    carry: Vec<u8>,
    window: usize,
    last_emitted: Option<(PromptKind, String)>,
    last_informational: Option<PromptKind>,
}

impl PromptClassifier {
    pub fn new(window: usize) -> Self {
        Self {
            history: String::new(),
            carry: Vec::new(),
            window: window.max(64),
            last_emitted: None,
            last_informational: None,
        }
    }

    /// Feeds one inbound chunk; returns a classification worth surfacing.
    ///
    /// Input-expecting prompts are returned once per occurrence: a repeat of
    /// the previous prompt with nothing but whitespace in between is
    /// swallowed until [`PromptClassifier::resolve`] runs. Informational kinds
    /// are returned only when the informational kind changes.
    pub fn classify(&mut self, raw: &[u8]) -> Option<Classification> {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(raw);
        let complete = complete_prefix(&bytes);
        self.carry = bytes.split_off(complete);
        let text = strip_escapes(&bytes);
        self.history.push_str(&text);
        self.trim_history();

        if let Some(detail) = detect_editor(&bytes, &self.history) {
            self.history.clear();
            return self.informational(Classification {
                prompt_text: String::new(),
                match_end: 0,
                match_start: 0,
                detail,
            });
        }

        let Some(found) = classify_text(&self.history) else {
            self.last_informational = None;
            return None;
        };
        let intervening = self.history[..found.match_start].trim().is_empty();
        self.consume(found.match_end);

        if !found.kind().expects_input() {
            return self.informational(found);
        }
        let fingerprint = (found.kind(), found.prompt_text.clone());
        if intervening && self.last_emitted.as_ref() == Some(&fingerprint) {
            tracing::debug!(kind = ?found.kind(), "Repeated prompt suppressed");
            return None;
        }
        self.last_emitted = Some(fingerprint);
        self.last_informational = None;
        Some(found)
    }

    pub fn resolve(&mut self, kind: PromptKind, resolution: &PromptResolution) -> Vec<u8> {
        self.last_emitted = None;
        match resolution {
            PromptResolution::Response(text) => {
                let mut bytes = text.as_bytes().to_vec();
                bytes.push(b'\n');
                bytes
            }
            PromptResolution::Cancelled | PromptResolution::TimedOut => {
                if kind.is_credential() {
                    vec![INTERRUPT]
                } else {
                    Vec::new()
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.carry.clear();
        self.history.clear();
        self.last_emitted = None;
        self.last_informational = None;
    }

    pub fn history(&self) -> &str {
        &self.history
    }

    fn informational(&mut self, found: Classification) -> Option<Classification> {
        let kind = found.kind();
        if self.last_informational == Some(kind) {
            return None;
        }
        self.last_informational = Some(kind);
        Some(found)
    }

    fn consume(&mut self, end: usize) {
        let end = end.min(self.history.len());
        self.history.drain(..end);
    }

    fn trim_history(&mut self) {
        if self.history.len() <= self.window {
            return;
        }
        let mut cut = self.history.len() - self.window;
        while !self.history.is_char_boundary(cut) {
            cut += 1;
        }
        self.history.drain(..cut);
    }
}

const MAX_CARRY: usize = 256;

fn complete_prefix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    let mut split = len;
    if let Some(esc) = bytes.iter().rposition(|&byte| byte == 0x1b) {
        let body = &bytes[esc + 1..];
        let open = match body.first() {
            None => true,
            Some(b'[') => !body[1..].iter().any(|byte| (0x40..=0x7e).contains(byte)),
            Some(b']') => !body[1..].contains(&0x07),
            Some(_) => false,
        };
        if open {
            split = esc;
        }
    }
    if split == len {
        let lead = bytes[len.saturating_sub(4)..]
            .iter()
            .rposition(|&byte| byte & 0xc0 != 0x80)
            .map(|offset| len.saturating_sub(4) + offset);
        if let Some(start) = lead {
            let width = match bytes[start] {
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                0xf0..=0xf7 => 4,
                _ => 1,
            };
            if len - start < width {
                split = start;
            }
        }
    }
    if len - split > MAX_CARRY { len } else { split }
}

/// Removes CSI/OSC/two-byte escape sequences and stray control bytes.
/// `\r\n` collapses to `\n`; a lone `\r` is kept so overwrites stay visible.
pub fn strip_escapes(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek().copied() {
                Some('[') => {
                    chars.next();
                    for next in chars.by_ref() {
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(text: &str) -> PromptKind {
        classify_text(text).map(|c| c.kind()).unwrap_or_default()
    }

    #[test]
    fn detects_password_without_trailing_newline() {
        let found = classify_text("Password: ").expect("password prompt");
        assert_eq!(found.kind(), PromptKind::Password);
        assert_eq!(found.prompt_text, "Password:");
        assert_eq!(kind_of("Password: \n"), PromptKind::None);
        assert_eq!(kind_of("alice@db01's password: "), PromptKind::Password);
        assert_eq!(
            kind_of("Enter passphrase for key '/home/alice/.ssh/id_ed25519': "),
            PromptKind::Password
        );
    }

    #[test]
    fn sudo_wins_over_password_and_extracts_user() {
        let found = classify_text("$ sudo ls\n[sudo] password for alice: ").expect("sudo");
        assert_eq!(
            found.detail,
            PromptDetail::Sudo {
                user: Some("alice".to_string())
            }
        );
    }

    #[test]
    fn detects_login_and_confirm() {
        assert_eq!(kind_of("Ubuntu 24.04\nlogin: "), PromptKind::Login);
        let found = classify_text(
            "Are you sure you want to continue connecting (yes/no/[fingerprint])? ",
        )
        .expect("confirm");
        assert_eq!(
            found.detail,
            PromptDetail::Confirm {
                options: vec!["yes".into(), "no".into(), "fingerprint".into()],
                default: None,
            }
        );
        let found = classify_text("Do you want to continue? [Y/n] ").expect("confirm");
        assert_eq!(
            found.detail,
            PromptDetail::Confirm {
                options: vec!["y".into(), "n".into()],
                default: Some("y".into()),
            }
        );
    }

    #[test]
    fn detects_numbered_menu() {
        let found = classify_text("1) start\n2) stop\n3) status\n#? ").expect("menu");
        assert_eq!(
            found.detail,
            PromptDetail::Menu {
                options: vec!["start".into(), "stop".into(), "status".into()]
            }
        );
        assert_eq!(kind_of("1) only one\nSelect an option: "), PromptKind::None);
    }

    #[test]
    fn progress_is_informational() {
        let found = classify_text("Downloading\r 45% [=====>     ]").expect("progress");
        assert_eq!(
            found.detail,
            PromptDetail::Progress { percent: Some(45) }
        );
        assert!(!found.kind().expects_input());
        assert_eq!(kind_of("disk at 250%"), PromptKind::None);
    }

    #[test]
    fn strips_escape_sequences() {
        let text = strip_escapes(b"\x1b[1;32mPassword:\x1b[0m \x1b]0;title\x07");
        assert_eq!(text, "Password: ");
        assert_eq!(strip_escapes(b"a\r\nb\rc"), "a\nb\rc");
    }

    #[test]
    fn repeated_chunk_classifies_once() {
        let mut classifier = PromptClassifier::new(1024);
        assert!(classifier.classify(b"Password: ").is_some());
        assert!(classifier.classify(b"Password: ").is_none());
        assert!(classifier.history().is_empty());
    }

    #[test]
    fn intervening_output_allows_new_prompt() {
        let mut classifier = PromptClassifier::new(1024);
        assert!(classifier.classify(b"Password: ").is_some());
        assert!(
            classifier
                .classify(b"\r\nPermission denied, please try again.\r\nPassword: ")
                .is_some()
        );
    }

    #[test]
    fn resolution_reenables_detection() {
        let mut classifier = PromptClassifier::new(1024);
        assert!(classifier.classify(b"Password: ").is_some());
        let bytes = classifier.resolve(
            PromptKind::Password,
            &PromptResolution::Response("secret".into()),
        );
        assert_eq!(bytes, b"secret\n");
        assert!(classifier.classify(b"\r\nPassword: ").is_some());
    }

    #[test]
    fn cancellation_interrupts_credential_prompts_only() {
        let mut classifier = PromptClassifier::new(1024);
        assert_eq!(
            classifier.resolve(PromptKind::Sudo, &PromptResolution::TimedOut),
            vec![INTERRUPT]
        );
        assert_eq!(
            classifier.resolve(PromptKind::Login, &PromptResolution::Cancelled),
            vec![INTERRUPT]
        );
        assert!(
            classifier
                .resolve(PromptKind::Confirm, &PromptResolution::Cancelled)
                .is_empty()
        );
    }

    #[test]
    fn editor_detected_from_alternate_screen() {
        let mut classifier = PromptClassifier::new(1024);
        let found = classifier
            .classify(b"\x1b[?1049h\x1b[H  GNU nano 7.2   notes.txt")
            .expect("editor");
        assert_eq!(
            found.detail,
            PromptDetail::Editor {
                program: Some("nano".into())
            }
        );
        assert!(classifier.classify(b"\x1b[?1049h").is_none());
    }

    #[test]
    fn history_window_is_bounded() {
        let mut classifier = PromptClassifier::new(64);
        for _ in 0..100 {
            classifier.classify("ñandú output line\n".as_bytes());
        }
        assert!(classifier.history().len() <= 64);
    }

    #[test]
    fn sequences_split_across_chunks_are_reassembled() {
        let mut classifier = PromptClassifier::new(4096);
        assert!(classifier.classify(b"\x1b[1;3").is_none());
        let found = classifier.classify(b"2mlogin: ").expect("login prompt");
        assert_eq!(found.kind(), PromptKind::Login);

        let mut classifier = PromptClassifier::new(4096);
        assert!(classifier.classify(b"caf\xc3").is_none());
        assert_eq!(classifier.history(), "caf");
        assert!(classifier.classify(b"\xa9 ").is_none());
        assert_eq!(classifier.history(), "caf\u{e9} ");
    }
}
