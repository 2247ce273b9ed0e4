//! Per-asset progress records and the rules for moving them between states.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::TransitionError;

/// Unique identity of a record in the status store, rendered as `"{scene_id}:{asset_type}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    pub scene_id: String,
    pub asset_type: String,
}

impl AssetKey {
    pub fn new(scene_id: &str, asset_type: &str) -> Self {
        Self {
            scene_id: scene_id.to_string(),
            asset_type: asset_type.to_string(),
        }
    }

    /// Asset types never contain ':', scene ids might, so split on the last one.
    pub fn parse(key: &str) -> Option<Self> {
        let (scene_id, asset_type) = key.rsplit_once(':')?;
        if scene_id.is_empty() || asset_type.is_empty() {
            return None;
        }
        Some(Self::new(scene_id, asset_type))
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scene_id, self.asset_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetState {
    Discovered,
    ActivationRequested,
    Activating,
    Active,
    Downloaded,
    Converted,
    Failed,
}

impl AssetState {
    pub const ALL: [AssetState; 7] = [
        Self::Discovered,
        Self::ActivationRequested,
        Self::Activating,
        Self::Active,
        Self::Downloaded,
        Self::Converted,
        Self::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Converted | Self::Failed)
    }

    /// States owned by the activation orchestrator.
    pub fn is_activation_phase(self) -> bool {
        matches!(
            self,
            Self::Discovered | Self::ActivationRequested | Self::Activating
        )
    }

    /// Whether `self -> to` is a legal step. Staying in a non-terminal state is
    /// allowed so that bookkeeping fields can be updated without a state change.
    pub fn can_move_to(self, to: AssetState) -> bool {
        use AssetState::*;
        if self.is_terminal() {
            return false;
        }
        if to == Failed || to == self {
            return true;
        }
        matches!(
            (self, to),
            (Discovered, ActivationRequested)
                | (ActivationRequested, Activating)
                | (ActivationRequested, Active)
                | (Activating, Active)
                | (Active, Downloaded)
                | (Downloaded, Converted)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::ActivationRequested => "activation requested",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Downloaded => "downloaded",
            Self::Converted => "converted",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub scene_id: String,
    pub asset_type: String,
    #[serde(default)]
    pub item_type: String,
    pub state: AssetState,
    pub cloud_cover: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub download_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl AssetRecord {
    pub fn discovered(
        key: &AssetKey,
        item_type: &str,
        acquired: Option<DateTime<Utc>>,
        cloud_cover: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            scene_id: key.scene_id.clone(),
            asset_type: key.asset_type.clone(),
            item_type: item_type.to_string(),
            state: AssetState::Discovered,
            cloud_cover,
            acquired,
            created_at: Some(now),
            updated_at: Some(now),
            last_checked_at: None,
            activation_requested_at: None,
            download_path: None,
            converted_path: None,
            failure_reason: None,
            download_attempts: 0,
            expected_size: None,
            checksum: None,
        }
    }

    pub fn key(&self) -> AssetKey {
        AssetKey::new(&self.scene_id, &self.asset_type)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `to`, stamping `activation_requested_at` on the one transition that sets it.
    pub fn advance(&mut self, to: AssetState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal {
                key: self.key().to_string(),
                state: self.state,
            });
        }
        if !self.state.can_move_to(to) {
            return Err(TransitionError::Illegal {
                key: self.key().to_string(),
                from: self.state,
                to,
            });
        }
        if self.state == AssetState::Discovered && to == AssetState::ActivationRequested {
            self.activation_requested_at = Some(now);
        }
        self.state = to;
        self.updated_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.advance(AssetState::Failed, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_checked(&mut self, now: DateTime<Utc>) {
        self.last_checked_at = Some(now);
        self.updated_at = Some(now);
    }

    /// Older stores may lack `activation_requested_at`; creation time stands in for it.
    pub fn activation_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if !matches!(
            self.state,
            AssetState::ActivationRequested | AssetState::Activating
        ) {
            return false;
        }
        match self.activation_requested_at.or(self.created_at) {
            Some(since) => now - since > timeout,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AssetState::*;

    fn record() -> AssetRecord {
        let key = AssetKey::new("20240101_123456_1a2b", "basic_analytic_8b");
        AssetRecord::discovered(&key, "PSScene", None, 10.0, Utc::now())
    }

    #[test]
    fn test_key_roundtrip() {
        let key = AssetKey::new("20240101_123456_1a2b", "ortho_visual");
        assert_eq!(key.to_string(), "20240101_123456_1a2b:ortho_visual");
        assert_eq!(AssetKey::parse(&key.to_string()), Some(key));
        assert_eq!(AssetKey::parse("no-separator"), None);
        assert_eq!(AssetKey::parse(":ortho_visual"), None);
    }

    #[test]
    fn test_forward_path() {
        let mut r = record();
        let now = Utc::now();
        for state in [ActivationRequested, Activating, Activating, Active, Downloaded, Converted] {
            r.advance(state, now).unwrap();
        }
        assert_eq!(r.state, Converted);
        assert!(r.is_terminal());
    }

    #[test]
    fn test_activation_requested_at_set_once() {
        let mut r = record();
        assert!(r.activation_requested_at.is_none());
        let first = Utc::now() - Duration::minutes(5);
        r.advance(ActivationRequested, first).unwrap();
        r.advance(Activating, Utc::now()).unwrap();
        r.advance(Active, Utc::now()).unwrap();
        assert_eq!(r.activation_requested_at, Some(first));
    }

    #[test]
    fn test_no_skip_to_active() {
        let mut r = record();
        let err = r.advance(Active, Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::Illegal { from: Discovered, to: Active, .. }));
        assert_eq!(r.state, Discovered);
    }

    #[test]
    fn test_no_backward_moves() {
        for (i, from) in AssetState::ALL.iter().enumerate() {
            for to in AssetState::ALL.iter().take(i) {
                if *to != Failed {
                    assert!(!from.can_move_to(*to), "{:?} -> {:?}", from, to);
                }
            }
        }
    }

    #[test]
    fn test_failed_reachable_from_non_terminal() {
        for state in AssetState::ALL {
            assert_eq!(state.can_move_to(Failed), !state.is_terminal());
        }
    }

    #[test]
    fn test_terminal_is_immutable() {
        let mut r = record();
        r.fail("gone", Utc::now()).unwrap();
        assert_eq!(r.failure_reason.as_deref(), Some("gone"));
        let err = r.fail("again", Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::Terminal { state: Failed, .. }));
        assert_eq!(r.failure_reason.as_deref(), Some("gone"));
    }

    #[test]
    fn test_activation_expired() {
        let mut r = record();
        let timeout = Duration::hours(4);
        assert!(!r.activation_expired(Utc::now(), timeout));
        r.advance(ActivationRequested, Utc::now() - Duration::hours(5))
            .unwrap();
        assert!(r.activation_expired(Utc::now(), timeout));
        assert!(!r.activation_expired(Utc::now() - Duration::hours(2), timeout));
    }

    #[test]
    fn test_activation_expired_falls_back_to_created_at() {
        let mut r = record();
        r.created_at = Some(Utc::now() - Duration::hours(6));
        let timeout = Duration::hours(4);
        assert!(!r.activation_expired(Utc::now(), timeout));

        // A legacy record: mid-activation with no request timestamp.
        r.state = Activating;
        assert!(r.activation_expired(Utc::now(), timeout));

        r.created_at = None;
        assert!(!r.activation_expired(Utc::now(), timeout));
    }
}
