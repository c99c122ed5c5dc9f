//! Attack command (`cra`).

use serde::Serialize;
use serde_json::Value;

use crate::commands::{execute, Outcome, SendOptions};
use crate::protocol::{Client, ProtocolError};

/// Command code for sending an attack.
pub const ATTACK_CODE: &str = "cra";

/// Parameters of an attack.
///
/// Army, boosters, tools and waves are passed through untouched; their
/// structure is defined by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Attack {
    /// Kingdom id.
    pub kingdom: i64,
    /// Source castle position.
    pub source: (i64, i64),
    /// Target position.
    pub target: (i64, i64),
    /// Army composition, one entry per wave.
    pub army: Value,
    /// Commanding lord, `0` for none.
    pub lord_id: i64,
    /// Horse type, `-1` for the default.
    pub horses_type: i64,
    /// Feather (travel speed-up) flag.
    pub feathers: i64,
    /// Slowdown applied.
    pub slowdown: i64,
    /// Boosters.
    pub boosters: Vec<Value>,
    /// Support tools.
    pub support_tools: Vec<Value>,
    /// Final wave composition.
    pub final_wave: Vec<Value>,
}

impl Default for Attack {
    fn default() -> Self {
        Self {
            kingdom: 0,
            source: (0, 0),
            target: (0, 0),
            army: Value::Array(Vec::new()),
            lord_id: 0,
            horses_type: -1,
            feathers: 0,
            slowdown: 0,
            boosters: Vec::new(),
            support_tools: Vec::new(),
            final_wave: Vec::new(),
        }
    }
}

impl Attack {
    /// An attack from `source` to `target` with `army`, defaults elsewhere.
    pub fn new(kingdom: i64, source: (i64, i64), target: (i64, i64), army: Value) -> Self {
        Self {
            kingdom,
            source,
            target,
            army,
            ..Self::default()
        }
    }

    /// Wire payload. Fields the client never varies keep their fixed values.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        let payload = AttackPayload {
            source_x: self.source.0,
            source_y: self.source.1,
            target_x: self.target.0,
            target_y: self.target.1,
            kingdom: self.kingdom,
            lord_id: self.lord_id,
            wall_tools: 0,
            horses_type: self.horses_type,
            bpc: 0,
            att: 0,
            av: 0,
            lp: 0,
            fc: 0,
            feathers: self.feathers,
            slowdown: self.slowdown,
            ica: 0,
            cd: 99,
            army: &self.army,
            boosters: &self.boosters,
            support_tools: &self.support_tools,
            final_wave: &self.final_wave,
            asct: 0,
        };
        serde_json::to_value(payload)
    }
}

/// `cra` parameters as the server names them.
#[derive(Serialize)]
#[serde(rename_all = "UPPERCASE")]
struct AttackPayload<'a> {
    #[serde(rename = "SX")]
    source_x: i64,
    #[serde(rename = "SY")]
    source_y: i64,
    #[serde(rename = "TX")]
    target_x: i64,
    #[serde(rename = "TY")]
    target_y: i64,
    #[serde(rename = "KID")]
    kingdom: i64,
    #[serde(rename = "LID")]
    lord_id: i64,
    #[serde(rename = "WT")]
    wall_tools: i64,
    #[serde(rename = "HBW")]
    horses_type: i64,
    bpc: i64,
    att: i64,
    av: i64,
    lp: i64,
    fc: i64,
    #[serde(rename = "PTT")]
    feathers: i64,
    #[serde(rename = "SD")]
    slowdown: i64,
    ica: i64,
    cd: i64,
    #[serde(rename = "A")]
    army: &'a Value,
    #[serde(rename = "BKS")]
    boosters: &'a [Value],
    #[serde(rename = "AST")]
    support_tools: &'a [Value],
    #[serde(rename = "RW")]
    final_wave: &'a [Value],
    asct: i64,
}

/// Send an attack.
pub fn send_attack(
    client: &Client,
    attack: &Attack,
    options: SendOptions,
) -> Result<Outcome, ProtocolError> {
    execute(client, ATTACK_CODE, &attack.payload()?, options)
}
