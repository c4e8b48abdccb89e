//! Session state: one identity, one proxy binding, a bounded run of requests.

use crate::modules::identity::Identity;
use crate::modules::proxy::ProxyCandidate;
use crate::modules::timing::PacingProfile;

/// A bounded run of requests sharing one identity and proxy binding.
///
/// A session always carries exactly one active identity. Rotation replaces
/// the whole session; the rotation threshold is re-rolled each time so the
/// period never becomes predictable.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    /// `None` means the direct connection path.
    pub bound_proxy: Option<ProxyCandidate>,
    pub downloads_this_session: u32,
    pub rotation_threshold: u32,
    pub pattern: PacingProfile,
}

impl Session {
    pub fn new(
        identity: Identity,
        bound_proxy: Option<ProxyCandidate>,
        rotation_threshold: u32,
        pattern: PacingProfile,
    ) -> Self {
        Self {
            identity,
            bound_proxy,
            downloads_this_session: 0,
            rotation_threshold,
            pattern,
        }
    }

    /// Record one finished download. The identity's request counter moves with
    /// the session counter; the identity's header set is never touched.
    pub fn record_download(&mut self) {
        self.downloads_this_session += 1;
        self.identity.requests_served += 1;
    }

    pub fn is_due_for_rotation(&self) -> bool {
        self.downloads_this_session >= self.rotation_threshold
    }

    /// Drop the proxy binding so the next attempt draws a fresh candidate.
    pub fn unbind_proxy(&mut self) {
        self.bound_proxy = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::identity::IdentityGenerator;

    #[test]
    fn download_counter_reaches_rotation_threshold() {
        let identity = IdentityGenerator::new().generate().unwrap();
        let mut session = Session::new(identity, None, 3, PacingProfile::Normal);
        assert!(!session.is_due_for_rotation());
        for _ in 0..3 {
            session.record_download();
        }
        assert!(session.is_due_for_rotation());
        assert_eq!(session.identity.requests_served, 3);
    }
}
