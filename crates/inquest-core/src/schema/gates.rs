//! Gates document: the six quality checks that control advancement.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};

/// Schema discriminator for `gates.json`.
pub const GATES_SCHEMA: &str = "gates.v1";

// ---------------------------------------------------------------------------
// Gate identity and classification
// ---------------------------------------------------------------------------

/// The six gates, serialized as `"A"`…`"F"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GateId {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl GateId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::F => "F",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            "E" => Ok(Self::E),
            "F" => Ok(Self::F),
            other => Err(CoreError::new(
                ErrorCode::UnknownGateId,
                format!("unknown gate id {other:?}"),
            )),
        }
    }

    pub fn all() -> [GateId; 6] {
        [Self::A, Self::B, Self::C, Self::D, Self::E, Self::F]
    }

    /// Display name for the initial gates document.
    pub fn name(&self) -> &'static str {
        match self {
            Self::A => "Planning completeness",
            Self::B => "Wave output contract",
            Self::C => "Citation validation integrity",
            Self::D => "Summary pack boundedness",
            Self::E => "Synthesis quality",
            Self::F => "Rollout safety",
        }
    }

    /// Hard gates block; soft gates may carry `warn`.
    pub fn class(&self) -> GateClass {
        match self {
            Self::A | Self::D => GateClass::Soft,
            Self::B | Self::C | Self::E | Self::F => GateClass::Hard,
        }
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateClass {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    NotRun,
    Pass,
    Fail,
    Warn,
}

// ---------------------------------------------------------------------------
// Gate record and document
// ---------------------------------------------------------------------------

/// One gate's persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub id: GateId,
    pub name: String,
    pub class: GateClass,
    pub status: GateStatus,
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: serde_json::Value,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

impl Gate {
    fn initial(id: GateId) -> Self {
        Self {
            id,
            name: id.name().to_string(),
            class: id.class(),
            status: GateStatus::NotRun,
            checked_at: None,
            metrics: serde_json::Value::Null,
            artifacts: Vec::new(),
            warnings: Vec::new(),
            notes: String::new(),
        }
    }
}

/// Whitelisted fields a gate patch may touch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatePatch {
    pub status: Option<GateStatus>,
    pub checked_at: Option<DateTime<Utc>>,
    pub metrics: Option<serde_json::Value>,
    pub artifacts: Option<Vec<String>>,
    pub warnings: Option<Vec<String>>,
    pub notes: Option<String>,
}

/// `gates.json` (schema `gates.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatesDoc {
    pub schema_version: String,
    /// Strictly increasing under optimistic locking.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    /// Digest of the inputs that produced the latest patch.
    pub inputs_digest: String,
    /// Keyed by gate id (`"A"`…`"F"`).
    pub gates: BTreeMap<String, Gate>,
}

impl GatesDoc {
    /// All six gates `not_run`, revision 1.
    pub fn initial(now: DateTime<Utc>) -> Self {
        let mut gates = BTreeMap::new();
        for id in GateId::all() {
            gates.insert(id.as_str().to_string(), Gate::initial(id));
        }
        Self {
            schema_version: GATES_SCHEMA.to_string(),
            revision: 1,
            updated_at: now,
            inputs_digest: String::new(),
            gates,
        }
    }

    pub fn gate(&self, id: GateId) -> Option<&Gate> {
        self.gates.get(id.as_str())
    }

    pub fn status(&self, id: GateId) -> GateStatus {
        self.gate(id).map(|g| g.status).unwrap_or(GateStatus::NotRun)
    }

    /// Structural validation; hard gates may never carry `warn`, and any
    /// gate that has been run must record when.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != GATES_SCHEMA {
            return Err(CoreError::schema(format!(
                "gates schema_version {:?}, expected {GATES_SCHEMA:?}",
                self.schema_version
            )));
        }
        if self.revision == 0 {
            return Err(CoreError::schema("gates revision must be >= 1"));
        }
        for id in GateId::all() {
            let gate = self.gates.get(id.as_str()).ok_or_else(|| {
                CoreError::schema(format!("gates document missing gate {id}"))
            })?;
            if gate.id != id {
                return Err(CoreError::schema(format!(
                    "gate entry {id} carries mismatched id {}",
                    gate.id
                )));
            }
            if gate.class == GateClass::Hard && gate.status == GateStatus::Warn {
                return Err(CoreError::schema(format!(
                    "hard gate {id} may not hold status warn"
                )));
            }
            if gate.status != GateStatus::NotRun && gate.checked_at.is_none() {
                return Err(CoreError::schema(format!(
                    "gate {id} has status {:?} but no checked_at",
                    gate.status
                )));
            }
        }
        Ok(())
    }
}
