//! User agent: `awl/<os>-<arch>/<version>`

/// Prefix shared by every awl user agent
pub const USER_AGENT_PREFIX: &str = "awl/";

/// Parsed user agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgent {
    /// `None` for legacy agents that only advertised a version
    pub os_arch: Option<String>,
    pub version: String,
}

/// Build the user agent advertised through identify
pub fn format_user_agent(version: &str) -> String {
    format!(
        "{}{}-{}/{}",
        USER_AGENT_PREFIX,
        std::env::consts::OS,
        std::env::consts::ARCH,
        version
    )
}

/// Parse a remote user agent; `None` if it is not an awl agent
pub fn parse_user_agent(agent: &str) -> Option<UserAgent> {
    let rest = agent.strip_prefix(USER_AGENT_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    match rest.split_once('/') {
        Some((os_arch, version)) if !os_arch.is_empty() => Some(UserAgent {
            os_arch: Some(os_arch.to_string()),
            version: version.to_string(),
        }),
        Some((_, version)) => Some(UserAgent {
            os_arch: None,
            version: version.to_string(),
        }),
        None => Some(UserAgent {
            os_arch: None,
            version: rest.to_string(),
        }),
    }
}
