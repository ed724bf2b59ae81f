//! Session lifecycle and connection fault handling.
//!
//! One mount owns one [`SessionManager`], which owns at most one live
//! [`Session`] at a time. A transport fault tears the session down —
//! client object and handle registry both — and, depending on
//! configuration, either drives the reconnect-confirmation loop or leaves
//! the mount offline for a per-call implicit reconnect. Configuration
//! (subtree restriction, read-only flag, credentials) is retained across
//! session generations.

use async_trait::async_trait;
use log::{info, warn};
use nix::errno::Errno;

use crate::client::{ConnectError, DirId, FaultKind, FileId, ShareClient};
use crate::config::{normalize_subtree, MountOptions};
use crate::handles::HandleRegistry;

/// Session-owned resource reference parked in the handle registry.
#[derive(Debug, Clone, Copy)]
pub enum Resource {
    File(FileId),
    Dir(DirId),
}

/// Builds connected protocol clients from mount options.
///
/// Initial-connection failures (bad endpoint, missing or rejected
/// credentials, handshake failure) are fatal [`ConnectError`]s and never
/// enter the retry loop.
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: ShareClient;

    async fn connect(
        &self,
        opts: &MountOptions,
        prompter: &dyn Prompter,
    ) -> Result<Self::Client, ConnectError>;
}

/// Interactive collaborator for credentials and reconnect confirmation.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Asks for a password; `None` means the user gave up.
    async fn request_password(&self, user: &str, server: &str) -> Option<String>;
    /// Asks whether another reconnection attempt should be made.
    async fn confirm_reconnect(&self, server: &str) -> bool;
}

/// One established protocol session and the state scoped to it.
pub struct Session<C> {
    pub client: C,
    pub handles: HandleRegistry<Resource>,
    /// Normalized subtree restriction, e.g. `/projects/current`.
    pub root: Option<String>,
    pub read_only: bool,
}

impl<C> Session<C> {
    /// Joins the subtree restriction with a host path and strips the
    /// leading slash: client paths are share-relative, the empty string
    /// being the share root.
    pub fn full_path(&self, path: &str) -> String {
        let mut joined = String::new();
        if let Some(root) = &self.root {
            joined.push_str(root);
        }
        if !path.starts_with('/') {
            joined.push('/');
        }
        joined.push_str(path);
        match joined.strip_prefix('/') {
            Some(stripped) => stripped.to_string(),
            None => joined,
        }
    }
}

enum ConnState<C> {
    /// No session; operations may attempt one implicit reconnect each.
    Offline,
    Online(Session<C>),
    /// Reconnection was declined; every operation fails until remount.
    Failed,
}

/// Connectivity state machine.
///
/// `Offline → Online` on (re-)establishment, `Online → Offline` on fault
/// with reconnection disabled, `Online → Online` through the confirmation
/// loop on fault with reconnection enabled, and `Online → Failed` once the
/// collaborator declines further attempts.
pub struct SessionManager<B: Connector, P: Prompter> {
    connector: B,
    prompter: P,
    opts: MountOptions,
    state: ConnState<B::Client>,
    /// Strictly increasing across session establishments; masked to the
    /// incarnation field width by the registry.
    generations: u32,
}

impl<B: Connector, P: Prompter> SessionManager<B, P> {
    pub fn new(connector: B, prompter: P, opts: MountOptions) -> Self {
        Self {
            connector,
            prompter,
            opts,
            state: ConnState::Offline,
            generations: 0,
        }
    }

    pub fn options(&self) -> &MountOptions {
        &self.opts
    }

    /// Establishes a fresh session with a fresh handle registry.
    pub async fn establish(&mut self) -> Result<(), ConnectError> {
        let client = self.connector.connect(&self.opts, &self.prompter).await?;
        self.generations += 1;
        let session = Session {
            client,
            handles: HandleRegistry::new(self.generations),
            root: self.opts.subtree.as_deref().and_then(normalize_subtree),
            read_only: self.opts.read_only,
        };
        info!(
            "connected to //{}/{} (session generation {})",
            self.opts.server, self.opts.share, self.generations
        );
        self.state = ConnState::Online(session);
        Ok(())
    }

    /// The live session, if any. Used by operations that must not trigger
    /// reconnection on entry (statfs, which the host polls relentlessly).
    pub fn online(&mut self) -> Option<&mut Session<B::Client>> {
        match &mut self.state {
            ConnState::Online(session) => Some(session),
            _ => None,
        }
    }

    /// The live session, establishing one first if the mount is offline.
    ///
    /// The boolean is `true` when the session was created by this call;
    /// stream operations use it to decide on entry handle recovery. A
    /// permanently failed mount yields `ENODEV` immediately.
    pub async fn ensure(&mut self) -> Result<(bool, &mut Session<B::Client>), Errno> {
        let fresh = match &self.state {
            ConnState::Online(_) => false,
            ConnState::Failed => return Err(Errno::ENODEV),
            ConnState::Offline => {
                // Offline only occurs with reconnect prompting disabled
                // (the fault path otherwise ends Online or Failed), so this
                // is the one implicit, unprompted attempt per call.
                if let Err(err) = self.establish().await {
                    warn!("implicit reconnect failed: {err}");
                    return Err(Errno::ENODEV);
                }
                true
            }
        };
        match &mut self.state {
            ConnState::Online(session) => Ok((fresh, session)),
            _ => Err(Errno::ENODEV),
        }
    }

    /// Fault path: tears the session down and, if configured, drives the
    /// reconnect-confirmation loop.
    ///
    /// Returns `true` once a replacement session is up. Returns `false`
    /// when reconnection is disabled (mount goes offline) or the
    /// collaborator declined (mount is permanently failed); the in-flight
    /// call then reports device-unavailable.
    pub async fn fault(&mut self, kind: FaultKind) -> bool {
        let state = std::mem::replace(&mut self.state, ConnState::Offline);
        if let ConnState::Online(session) = state {
            warn!(
                "transport fault ({kind}) on //{}/{}: {}",
                self.opts.server,
                self.opts.share,
                session.client.last_error()
            );
            // Dropping the session drops the client object and the handle
            // registry; every outstanding handle is now permanently
            // unresolvable. Remote resources die with the connection.
        }

        if !self.opts.reconnect {
            return false;
        }

        while self.prompter.confirm_reconnect(&self.opts.server).await {
            match self.establish().await {
                Ok(()) => return true,
                Err(err) => warn!("reconnect attempt failed: {err}"),
            }
        }
        info!(
            "reconnection to //{}/{} declined; share unavailable until remount",
            self.opts.server, self.opts.share
        );
        self.state = ConnState::Failed;
        false
    }

    /// Orderly teardown on unmount.
    pub async fn shutdown(&mut self) {
        if let ConnState::Online(session) = std::mem::replace(&mut self.state, ConnState::Offline) {
            if let Err(err) = session.client.disconnect().await {
                warn!("disconnect failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoPrompt;

    #[async_trait]
    impl Prompter for NoPrompt {
        async fn request_password(&self, _user: &str, _server: &str) -> Option<String> {
            None
        }
        async fn confirm_reconnect(&self, _server: &str) -> bool {
            false
        }
    }

    fn session_with_root(root: Option<&str>) -> Session<()> {
        Session {
            client: (),
            handles: HandleRegistry::new(1),
            root: root.map(String::from),
            read_only: false,
        }
    }

    #[test]
    fn full_path_strips_the_leading_slash() {
        let sess = session_with_root(None);
        assert_eq!(sess.full_path("/a/b"), "a/b");
        assert_eq!(sess.full_path("/"), "");
    }

    #[test]
    fn full_path_applies_the_subtree_restriction() {
        let sess = session_with_root(Some("/sub/dir"));
        assert_eq!(sess.full_path("/a"), "sub/dir/a");
        assert_eq!(sess.full_path("/"), "sub/dir/");
        assert_eq!(sess.full_path("a"), "sub/dir/a");
    }

    #[tokio::test]
    async fn prompter_defaults_are_inert() {
        // guards the trait signatures; behavior is covered in tests/ops.rs
        let p = NoPrompt;
        assert_eq!(p.request_password("u", "s").await, None);
        assert!(!p.confirm_reconnect("s").await);
    }
}
