use crate::models::capacity::{AdmissionDenial, DenialReason};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub name: String,
    pub waves: Vec<PlanWave>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanWave {
    pub wave_number: u32,
    pub name: String,
    #[serde(default)]
    pub pause_before_wave: bool,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    pub protection_groups: Vec<ProtectionGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionGroup {
    pub id: String,
    pub server_ids: Vec<String>,
}

impl RecoveryPlan {
    /// Checks that the waves form a linear, start-able sequence. A dependency
    /// on the same or a later wave is a cycle in a linear order.
    pub fn validate(&self) -> Result<(), AdmissionDenial> {
        if self.waves.is_empty() {
            return Err(invalid(format!("plan '{}' has no waves", self.id)));
        }

        let mut seen_servers = HashSet::new();
        for (index, wave) in self.waves.iter().enumerate() {
            if wave.wave_number as usize != index {
                return Err(invalid(format!(
                    "wave '{}' has number {} but is at position {}",
                    wave.name, wave.wave_number, index
                )));
            }
            if index == 0 && wave.pause_before_wave {
                return Err(invalid("the first wave cannot pause before launch".to_string()));
            }
            if let Some(dep) = wave.depends_on.iter().find(|dep| **dep >= wave.wave_number) {
                return Err(invalid(format!(
                    "wave {} depends on wave {}, which does not precede it",
                    wave.wave_number, dep
                )));
            }

            let mut server_count = 0;
            for group in &wave.protection_groups {
                if group.server_ids.is_empty() {
                    return Err(invalid(format!(
                        "protection group {} in wave {} has no servers",
                        group.id, wave.wave_number
                    )));
                }
                for server_id in &group.server_ids {
                    if !seen_servers.insert(server_id.as_str()) {
                        return Err(invalid(format!(
                            "server {} appears more than once in the plan",
                            server_id
                        )));
                    }
                    server_count += 1;
                }
            }
            if server_count == 0 {
                return Err(invalid(format!("wave {} has no servers", wave.wave_number)));
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> AdmissionDenial {
    AdmissionDenial {
        reason: DenialReason::InvalidPlan,
        message,
        limit: None,
        current: None,
        conflicts: Vec::new(),
    }
}
