//! Mount configuration.

/// Options recognized at mount time.
///
/// Connectivity settings (`server`, `share`, credentials, `domain`) are
/// consumed by the [`crate::session::Connector`]; the rest steers the
/// operation layer itself. Configuration survives reconnects — only the
/// session and its handle registry are torn down on a fault.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub server: String,
    pub share: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    /// Fixed volume label; defaults to `server-share`.
    pub volume: Option<String>,
    /// Raw subtree restriction, normalized by [`normalize_subtree`].
    pub subtree: Option<String>,
    pub read_only: bool,
    /// Ask the interactive collaborator for a password when none is
    /// configured.
    pub prompt_password: bool,
    /// Transparently re-open stream handles after reconnection.
    pub handle_recovery: bool,
    /// On a transport fault, ask the interactive collaborator and keep
    /// re-establishing the session until it declines. When off, a fault
    /// fails the in-flight call and later calls attempt one implicit
    /// fresh connection each.
    pub reconnect: bool,
}

impl MountOptions {
    pub fn new(server: impl Into<String>, share: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            share: share.into(),
            user: None,
            password: None,
            domain: None,
            volume: None,
            subtree: None,
            read_only: false,
            prompt_password: true,
            handle_recovery: true,
            reconnect: false,
        }
    }

    pub fn volume_name(&self) -> String {
        match &self.volume {
            Some(label) => label.clone(),
            None => format!("{}-{}", self.server, self.share),
        }
    }
}

/// Normalizes a subtree restriction segment by segment.
///
/// Empty segments and `.` are dropped; `..` removes the previous segment
/// and never ascends above the share root. Returns `None` when the path
/// collapses to the root (no restriction).
pub fn normalize_subtree(raw: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(format!("/{}", segments.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_path_gets_leading_slash() {
        assert_eq!(normalize_subtree("a/b/c").as_deref(), Some("/a/b/c"));
        assert_eq!(normalize_subtree("/a/b").as_deref(), Some("/a/b"));
    }

    #[test]
    fn dots_and_empty_segments_are_dropped() {
        assert_eq!(normalize_subtree("a//./b/").as_deref(), Some("/a/b"));
        assert_eq!(normalize_subtree("./a/./").as_deref(), Some("/a"));
    }

    #[test]
    fn dotdot_pops_but_never_escapes_the_root() {
        assert_eq!(normalize_subtree("a/b/../c").as_deref(), Some("/a/c"));
        assert_eq!(normalize_subtree("a/../../b").as_deref(), Some("/b"));
        assert_eq!(normalize_subtree("../.."), None);
    }

    #[test]
    fn root_collapses_to_no_restriction() {
        assert_eq!(normalize_subtree(""), None);
        assert_eq!(normalize_subtree("/"), None);
        assert_eq!(normalize_subtree("a/.."), None);
    }

    #[test]
    fn default_volume_label_is_server_share() {
        let mut opts = MountOptions::new("fileserver", "public");
        assert_eq!(opts.volume_name(), "fileserver-public");
        opts.volume = Some("Work".into());
        assert_eq!(opts.volume_name(), "Work");
    }
}
