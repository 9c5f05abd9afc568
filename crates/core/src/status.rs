//! Canonical job lifecycle and the translation between status spaces.
//!
//! Two authorities report job state: the ledger (codes 300..=311) and the
//! render engine (codes 0..=200). Everything that crosses the wire is a raw
//! integer; [`translate`] maps either space onto [`CanonicalStatus`] and
//! [`reconcile`] / [`advance`] merge opinions without moving backwards.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::EngineSnapshot;

// ── Canonical status ──────────────────────────────────────────

/// Lifecycle state of a render job as seen by the outside world.
///
/// Declaration order equals code order, so the derived `Ord` is the rank
/// used for merging. `Disabled` and `Error` sit above the lifecycle and
/// override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CanonicalStatus {
    Uploading,
    Uploaded,
    Submitting,
    Prerender,
    Previews,
    Rendering,
    Postrender,
    Finished,
    PreparingDownload,
    Downloadable,
    Disabled,
    Error,
}

impl CanonicalStatus {
    pub const ALL: [CanonicalStatus; 12] = [
        Self::Uploading,
        Self::Uploaded,
        Self::Submitting,
        Self::Prerender,
        Self::Previews,
        Self::Rendering,
        Self::Postrender,
        Self::Finished,
        Self::PreparingDownload,
        Self::Downloadable,
        Self::Disabled,
        Self::Error,
    ];

    /// Numeric wire value (300..=311).
    pub fn code(self) -> u16 {
        match self {
            Self::Uploading => 300,
            Self::Uploaded => 301,
            Self::Submitting => 302,
            Self::Prerender => 303,
            Self::Previews => 304,
            Self::Rendering => 305,
            Self::Postrender => 306,
            Self::Finished => 307,
            Self::PreparingDownload => 308,
            Self::Downloadable => 309,
            Self::Disabled => 310,
            Self::Error => 311,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| i64::from(s.code()) == code)
    }

    /// Upper-case name used by the query API.
    pub fn label(self) -> &'static str {
        match self {
            Self::Uploading => "UPLOADING",
            Self::Uploaded => "UPLOADED",
            Self::Submitting => "SUBMITTING",
            Self::Prerender => "PRERENDER",
            Self::Previews => "PREVIEWS",
            Self::Rendering => "RENDERING",
            Self::Postrender => "POSTRENDER",
            Self::Finished => "FINISHED",
            Self::PreparingDownload => "PREPARINGDOWNLOAD",
            Self::Downloadable => "DOWNLOADABLE",
            Self::Disabled => "DISABLED",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disabled | Self::Error)
    }

    pub fn rank(self) -> u16 {
        self.code()
    }

    /// Stringified code, as carried in the `status` payload field.
    pub fn wire(self) -> String {
        self.code().to_string()
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CanonicalStatus {
    type Err = CoreError;

    /// Accepts either the label (`"FINISHED"`) or the code (`"307"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(status) = Self::ALL
            .iter()
            .copied()
            .find(|st| st.label().eq_ignore_ascii_case(trimmed))
        {
            return Ok(status);
        }
        let code = parse_raw(trimmed)?;
        Self::from_code(code).ok_or(CoreError::UnknownStatus(code))
    }
}

// ── Engine status space ───────────────────────────────────────

/// States reported by the render engine for a single job layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineState {
    None,
    FirstCheck,
    WaitForJobs,
    ScriptPreRender,
    PreviewRender,
    ScriptAfterPreview,
    WaitForApprovalMain,
    WaitForJobsAfterPreview,
    MainRender,
    ScriptPostRender,
    WaitForApprovalDone,
    ScriptFinished,
    Finished,
}

impl EngineState {
    pub fn from_code(code: i64) -> Option<Self> {
        let state = match code {
            0 => Self::None,
            20 => Self::FirstCheck,
            40 => Self::WaitForJobs,
            60 => Self::ScriptPreRender,
            80 => Self::PreviewRender,
            90 => Self::ScriptAfterPreview,
            100 => Self::WaitForApprovalMain,
            110 => Self::WaitForJobsAfterPreview,
            120 => Self::MainRender,
            140 => Self::ScriptPostRender,
            160 => Self::WaitForApprovalDone,
            180 => Self::ScriptFinished,
            200 => Self::Finished,
            _ => return None,
        };
        Some(state)
    }

    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::FirstCheck => 20,
            Self::WaitForJobs => 40,
            Self::ScriptPreRender => 60,
            Self::PreviewRender => 80,
            Self::ScriptAfterPreview => 90,
            Self::WaitForApprovalMain => 100,
            Self::WaitForJobsAfterPreview => 110,
            Self::MainRender => 120,
            Self::ScriptPostRender => 140,
            Self::WaitForApprovalDone => 160,
            Self::ScriptFinished => 180,
            Self::Finished => 200,
        }
    }

    /// Canonical opinion of this engine state, if it has one.
    ///
    /// Waiting and approval states carry no lifecycle information.
    pub fn canonical(self) -> Option<CanonicalStatus> {
        match self {
            Self::ScriptPreRender => Some(CanonicalStatus::Prerender),
            Self::PreviewRender => Some(CanonicalStatus::Previews),
            Self::MainRender => Some(CanonicalStatus::Rendering),
            Self::ScriptPostRender => Some(CanonicalStatus::Postrender),
            Self::ScriptFinished | Self::Finished => Some(CanonicalStatus::Finished),
            _ => None,
        }
    }
}

// ── Translation and merging ───────────────────────────────────

/// Parse the raw `status` value as it arrives on the wire.
pub fn parse_raw(value: &str) -> Result<i64, CoreError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| CoreError::InvalidStatus(value.to_string()))
}

/// Map a raw status from either authority onto the canonical lifecycle.
///
/// Codes in the ledger band pass through unchanged, engine codes go through
/// the engine table. Anything else yields `None` ("no opinion").
pub fn translate(raw: i64) -> Option<CanonicalStatus> {
    if let Some(status) = CanonicalStatus::from_code(raw) {
        return Some(status);
    }
    match EngineState::from_code(raw) {
        Some(state) => state.canonical(),
        None => {
            tracing::debug!(raw, "status code outside both status spaces, ignoring");
            None
        }
    }
}

/// Merge the ledger status with the live engine view.
///
/// A disabled engine job is `Disabled` regardless of the ledger. Otherwise
/// the engine opinion replaces the ledger only when it ranks strictly higher.
pub fn reconcile(ledger: CanonicalStatus, engine: Option<&EngineSnapshot>) -> CanonicalStatus {
    let Some(engine) = engine else {
        return ledger;
    };
    if engine.disabled {
        return CanonicalStatus::Disabled;
    }
    if ledger.is_terminal() {
        return ledger;
    }
    match engine.status.and_then(translate) {
        Some(opinion) if opinion.rank() > ledger.rank() => opinion,
        _ => ledger,
    }
}

/// Apply an inbound status to the currently persisted one.
///
/// Terminal statuses always take effect. A terminal current status is kept
/// against lifecycle input; between lifecycle states the later one wins.
pub fn advance(current: CanonicalStatus, incoming: CanonicalStatus) -> CanonicalStatus {
    if incoming.is_terminal() {
        return incoming;
    }
    if current.is_terminal() {
        return current;
    }
    current.max(incoming)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(status: Option<i64>, disabled: bool) -> EngineSnapshot {
        EngineSnapshot {
            status,
            remaining_secs: 0,
            disabled,
        }
    }

    #[test]
    fn codes_roundtrip_through_from_code() {
        for status in CanonicalStatus::ALL {
            assert_eq!(CanonicalStatus::from_code(status.code().into()), Some(status));
        }
        assert_eq!(CanonicalStatus::from_code(312), None);
    }

    #[test]
    fn main_render_translates_to_rendering() {
        assert_eq!(translate(120), Some(CanonicalStatus::Rendering));
        assert_eq!(translate(60), Some(CanonicalStatus::Prerender));
        assert_eq!(translate(80), Some(CanonicalStatus::Previews));
        assert_eq!(translate(140), Some(CanonicalStatus::Postrender));
        assert_eq!(translate(180), Some(CanonicalStatus::Finished));
        assert_eq!(translate(200), Some(CanonicalStatus::Finished));
    }

    #[test]
    fn waiting_states_have_no_opinion() {
        for code in [0, 20, 40, 90, 100, 110, 160] {
            assert_eq!(translate(code), None, "code {code}");
        }
    }

    #[test]
    fn unknown_codes_have_no_opinion() {
        assert_eq!(translate(9999), None);
        assert_eq!(translate(-1), None);
        assert_eq!(translate(250), None);
    }

    #[test]
    fn ledger_codes_pass_through() {
        assert_eq!(translate(307), Some(CanonicalStatus::Finished));
        assert_eq!(translate(311), Some(CanonicalStatus::Error));
    }

    #[test]
    fn reconcile_without_engine_keeps_ledger() {
        assert_eq!(
            reconcile(CanonicalStatus::Uploaded, None),
            CanonicalStatus::Uploaded
        );
        let silent = engine(Some(9999), false);
        assert_eq!(
            reconcile(CanonicalStatus::Uploaded, Some(&silent)),
            CanonicalStatus::Uploaded
        );
    }

    #[test]
    fn reconcile_takes_higher_engine_opinion() {
        let rendering = engine(Some(120), false);
        assert_eq!(
            reconcile(CanonicalStatus::Submitting, Some(&rendering)),
            CanonicalStatus::Rendering
        );
    }

    #[test]
    fn reconcile_never_moves_backwards() {
        let prerender = engine(Some(60), false);
        assert_eq!(
            reconcile(CanonicalStatus::Downloadable, Some(&prerender)),
            CanonicalStatus::Downloadable
        );
    }

    #[test]
    fn disabled_engine_overrides_everything() {
        let disabled = engine(Some(120), true);
        for ledger in CanonicalStatus::ALL {
            assert_eq!(reconcile(ledger, Some(&disabled)), CanonicalStatus::Disabled);
        }
    }

    #[test]
    fn reconcile_is_at_least_both_inputs() {
        for ledger in CanonicalStatus::ALL {
            for code in [0, 60, 80, 120, 140, 180, 200] {
                let snap = engine(Some(code), false);
                let merged = reconcile(ledger, Some(&snap));
                assert!(merged.rank() >= ledger.rank());
                if let Some(opinion) = translate(code) {
                    if !ledger.is_terminal() {
                        assert!(merged.rank() >= opinion.rank());
                    }
                }
            }
        }
    }

    #[test]
    fn advance_is_monotonic_between_lifecycle_states() {
        assert_eq!(
            advance(CanonicalStatus::Rendering, CanonicalStatus::Prerender),
            CanonicalStatus::Rendering
        );
        assert_eq!(
            advance(CanonicalStatus::Submitting, CanonicalStatus::Finished),
            CanonicalStatus::Finished
        );
    }

    #[test]
    fn advance_lets_terminals_win() {
        assert_eq!(
            advance(CanonicalStatus::Downloadable, CanonicalStatus::Error),
            CanonicalStatus::Error
        );
        assert_eq!(
            advance(CanonicalStatus::Error, CanonicalStatus::Disabled),
            CanonicalStatus::Disabled
        );
        assert_eq!(
            advance(CanonicalStatus::Disabled, CanonicalStatus::Finished),
            CanonicalStatus::Disabled
        );
    }

    #[test]
    fn parse_accepts_labels_and_codes() {
        assert_eq!("FINISHED".parse::<CanonicalStatus>(), Ok(CanonicalStatus::Finished));
        assert_eq!("307".parse::<CanonicalStatus>(), Ok(CanonicalStatus::Finished));
        assert_eq!(
            "preparingdownload".parse::<CanonicalStatus>(),
            Ok(CanonicalStatus::PreparingDownload)
        );
        assert_eq!("120".parse::<CanonicalStatus>(), Err(CoreError::UnknownStatus(120)));
        assert!(matches!(
            "soon".parse::<CanonicalStatus>(),
            Err(CoreError::InvalidStatus(_))
        ));
    }

    #[test]
    fn labels_serialize_upper_case() {
        let json = serde_json::to_string(&CanonicalStatus::PreparingDownload).unwrap();
        assert_eq!(json, "\"PREPARINGDOWNLOAD\"");
        assert_eq!(CanonicalStatus::Error.wire(), "311");
    }
}
