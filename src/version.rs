pub const LABEL: &str = env!("TABMUX_VERSION_LABEL");
pub const GIT_SHA: &str = env!("TABMUX_GIT_SHA");
pub const BUILD_TIME: &str = env!("TABMUX_BUILD_TIME");

const WITH_GIT: &str = concat!(
    env!("TABMUX_VERSION_LABEL"),
    " (git ",
    env!("TABMUX_GIT_SHA"),
    ", built ",
    env!("TABMUX_BUILD_TIME"),
    ")",
);
const WITHOUT_GIT: &str = concat!(
    env!("TABMUX_VERSION_LABEL"),
    " (built ",
    env!("TABMUX_BUILD_TIME"),
    ")",
);

pub const VERSION: &str = if GIT_SHA.is_empty() {
    WITHOUT_GIT
} else {
    WITH_GIT
};

pub fn writer_tag() -> String {
    if GIT_SHA.is_empty() {
        format!("{}/{}", LABEL, std::process::id())
    } else {
        format!("{}+{}/{}", LABEL, GIT_SHA, std::process::id())
    }
}
