//! Rank table parsing and validation (§3, §9), grounded on the source's
//! `CheckRankConfig`: a rank table lists, per rank, its ip and device id,
//! and must describe a layout the coordinator can actually fan out to.
use serde::Deserialize;

use crate::error::RankTableError;

const CARD_COUNT_PER_MACHINE: u32 = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct RankItem {
    pub ip: String,
    pub device_id: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankTable {
    pub rank_size: u32,
    pub stage_size: u32,
    pub rank_list: Vec<RankItem>,
}

impl RankTable {
    pub fn parse(json: &str) -> Result<Self, RankTableError> {
        let table: RankTable = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn parallel_count(&self) -> u32 {
        self.rank_size / self.stage_size
    }

    /// Validate the table the same way the source's `CheckRankConfig`
    /// does: sizes line up, and when a servable spans more than one
    /// stage, every consecutive 8-rank window sits on one machine with
    /// device ids `0..8` in order.
    pub fn validate(&self) -> Result<(), RankTableError> {
        if self.stage_size == 0 || self.rank_size == 0 {
            return Err(RankTableError::ZeroSize {
                rank_size: self.rank_size,
                stage_size: self.stage_size,
            });
        }
        if self.rank_size % self.stage_size != 0 {
            return Err(RankTableError::NotMultiple {
                rank_size: self.rank_size,
                stage_size: self.stage_size,
            });
        }
        if self.rank_list.len() as u32 != self.rank_size {
            return Err(RankTableError::CountMismatch {
                declared: self.rank_list.len(),
                rank_size: self.rank_size,
            });
        }

        if self.stage_size == 1 {
            let mut device_map: std::collections::HashMap<&str, std::collections::HashSet<u32>> =
                std::collections::HashMap::new();
            for (i, item) in self.rank_list.iter().enumerate() {
                let seen = device_map.entry(item.ip.as_str()).or_default();
                if !seen.insert(item.device_id) {
                    return Err(RankTableError::DuplicateDeviceId {
                        rank_id: i as u32,
                        ip: item.ip.clone(),
                    });
                }
            }
            return Ok(());
        }

        if self.rank_size < CARD_COUNT_PER_MACHINE {
            return Err(RankTableError::RankSizeTooSmall {
                rank_size: self.rank_size,
                stage_size: self.stage_size,
            });
        }
        let parallel_count = self.parallel_count();
        if parallel_count % CARD_COUNT_PER_MACHINE != 0 {
            return Err(RankTableError::ParallelCountNotMultipleOf8 { parallel_count });
        }

        let mut i = 0u32;
        while i < self.rank_size {
            let first = &self.rank_list[i as usize];
            let window_end = (i + CARD_COUNT_PER_MACHINE).min(self.rank_size);
            for rank_id in i..window_end {
                let k = rank_id - i;
                let item = &self.rank_list[rank_id as usize];
                if item.device_id != k {
                    return Err(RankTableError::WrongDeviceId {
                        rank_id,
                        expected: k,
                        actual: item.device_id,
                    });
                }
                if item.ip != first.ip {
                    return Err(RankTableError::WrongIp {
                        rank_id,
                        leader_rank: i,
                        expected: first.ip.clone(),
                        actual: item.ip.clone(),
                    });
                }
            }
            i += CARD_COUNT_PER_MACHINE;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_json(rank_size: u32, stage_size: u32, ranks: &[(&str, u32)]) -> String {
        let rank_list: Vec<String> = ranks
            .iter()
            .map(|(ip, id)| format!(r#"{{"ip":"{ip}","device_id":{id}}}"#))
            .collect();
        format!(
            r#"{{"rank_size":{rank_size},"stage_size":{stage_size},"rank_list":[{}]}}"#,
            rank_list.join(",")
        )
    }

    #[test]
    fn single_stage_allows_distinct_devices_per_ip() {
        let json = table_json(2, 1, &[("10.0.0.1", 0), ("10.0.0.1", 1)]);
        RankTable::parse(&json).unwrap();
    }

    #[test]
    fn single_stage_rejects_duplicate_device_on_same_ip() {
        let json = table_json(2, 1, &[("10.0.0.1", 0), ("10.0.0.1", 0)]);
        let err = RankTable::parse(&json).unwrap_err();
        assert!(matches!(err, RankTableError::DuplicateDeviceId { .. }));
    }

    #[test]
    fn multi_stage_requires_at_least_8_ranks() {
        let json = table_json(4, 2, &[("a", 0), ("a", 1), ("a", 2), ("a", 3)]);
        let err = RankTable::parse(&json).unwrap_err();
        assert!(matches!(err, RankTableError::RankSizeTooSmall { .. }));
    }

    #[test]
    fn multi_stage_validates_8_rank_windows() {
        let ranks: Vec<(&str, u32)> = (0..16).map(|i| (if i < 8 { "m1" } else { "m2" }, i % 8)).collect();
        let json = table_json(16, 2, &ranks);
        RankTable::parse(&json).unwrap();
    }

    #[test]
    fn multi_stage_rejects_wrong_device_id_ordering() {
        let mut ranks: Vec<(&str, u32)> = (0..8).map(|i| ("m1", i)).collect();
        ranks[1] = ("m1", 5);
        let json = table_json(8, 2, &ranks);
        let err = RankTable::parse(&json).unwrap_err();
        assert!(matches!(err, RankTableError::WrongDeviceId { .. }));
    }

    #[test]
    fn multi_stage_rejects_window_spanning_two_ips() {
        let mut ranks: Vec<(&str, u32)> = (0..8).map(|i| ("m1", i)).collect();
        ranks[4] = ("m2", 4);
        let json = table_json(8, 2, &ranks);
        let err = RankTable::parse(&json).unwrap_err();
        assert!(matches!(err, RankTableError::WrongIp { .. }));
    }

    #[test]
    fn rank_count_mismatch_rejected() {
        let json = table_json(4, 1, &[("a", 0)]);
        let err = RankTable::parse(&json).unwrap_err();
        assert!(matches!(err, RankTableError::CountMismatch { .. }));
    }

    #[test]
    fn malformed_json_rejected() {
        let err = RankTable::parse("not json").unwrap_err();
        assert!(matches!(err, RankTableError::Json(_)));
    }
}
