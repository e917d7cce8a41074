//! The key record model and liveness/revocation state machine (§3, §4.5).

use std::collections::HashMap;
use std::net::IpAddr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// An immutable liveness report from a holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliveMessage {
    pub timestamp: i64,
    pub ip: IpAddr,
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandContent {
    Mount,
    Umount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub valid_from: i64,
    pub validity_sec: i64,
    pub content: CommandContent,
    pub seen_by_client: bool,
    pub client_result: Option<String>,
}

impl PendingCommand {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.valid_from + self.validity_sec
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub uuid: String,
    pub id: String,
    pub creation_time: i64,
    /// Present when the key is held locally; `None` when escrowed externally
    /// (see `external_id`).
    pub key_material: Option<Vec<u8>>,
    pub external_id: Option<String>,
    pub mount_point: String,
    pub mount_options: String,
    pub max_active: u32,
    pub alive_interval_sec: i64,
    pub alive_count: u32,
    pub alive_messages: HashMap<IpAddr, Vec<AliveMessage>>,
    pub last_retrieval: Option<AliveMessage>,
    pub pending_commands: HashMap<IpAddr, Vec<PendingCommand>>,
}

impl KeyRecord {
    pub fn new_uuid() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        format_uuid(&bytes)
    }

    pub fn alive_window_sec(&self) -> i64 {
        self.alive_interval_sec * self.alive_count as i64
    }

    /// RemoveDeadHosts (§4.5): drop holders whose newest report has aged out
    /// of the liveness window, and compact each remaining holder's message
    /// queue to `alive_count` entries. Pure w.r.t. the rest of the record.
    pub fn remove_dead_hosts(&mut self, now: i64) {
        let window = self.alive_window_sec();
        let cap = self.alive_count as usize;
        self.alive_messages.retain(|_, msgs| {
            if let Some(newest) = msgs.iter().map(|m| m.timestamp).max() {
                now - newest <= window
            } else {
                false
            }
        });
        for msgs in self.alive_messages.values_mut() {
            msgs.sort_by_key(|m| m.timestamp);
            if msgs.len() > cap {
                let drop = msgs.len() - cap;
                msgs.drain(0..drop);
            }
        }
    }

    pub fn alive_holder_count(&self) -> usize {
        self.alive_messages.len()
    }

    pub fn is_alive_holder(&self, ip: &IpAddr) -> bool {
        self.alive_messages.contains_key(ip)
    }

    /// Appends a report for `ip`, creating the holder if absent, and trims
    /// the per-holder queue to `alive_count` entries (invariant: never
    /// exceeds `alive_count`).
    fn push_alive_message(&mut self, ip: IpAddr, hostname: String, now: i64) {
        let cap = self.alive_count.max(1) as usize;
        let entry = self.alive_messages.entry(ip).or_default();
        entry.push(AliveMessage { timestamp: now, ip, hostname });
        if entry.len() > cap {
            let drop = entry.len() - cap;
            entry.drain(0..drop);
        }
    }

    /// Grants a holder slot for `ip` if either already a holder, or capacity
    /// allows a new one. Returns whether the grant succeeded. Always applies
    /// `RemoveDeadHosts` first, per §4.5 step 1.
    pub fn try_auto_grant(&mut self, ip: IpAddr, hostname: String, now: i64) -> bool {
        self.remove_dead_hosts(now);
        let already_holder = self.is_alive_holder(&ip);
        if !already_holder && self.alive_holder_count() >= self.max_active as usize {
            return false;
        }
        self.push_alive_message(ip, hostname.clone(), now);
        self.last_retrieval = Some(AliveMessage { timestamp: now, ip, hostname });
        true
    }

    /// Unconditional grant used by ManualRetrieveKey — capacity is ignored.
    pub fn manual_grant(&mut self, ip: IpAddr, hostname: String, now: i64) {
        self.remove_dead_hosts(now);
        self.push_alive_message(ip, hostname.clone(), now);
        self.last_retrieval = Some(AliveMessage { timestamp: now, ip, hostname });
    }

    /// ReportAlive for one holder. Returns `true` if the report was accepted
    /// (the caller is a known, still-alive holder); `false` means this uuid
    /// belongs in `rejected_uuids`.
    pub fn report_alive(&mut self, ip: IpAddr, hostname: String, now: i64) -> bool {
        self.remove_dead_hosts(now);
        if !self.is_alive_holder(&ip) {
            return false;
        }
        self.push_alive_message(ip, hostname, now);
        true
    }

    pub fn send_command(&mut self, target_ip: IpAddr, content: CommandContent, now: i64, validity_sec: i64) {
        self.pending_commands.entry(target_ip).or_default().push(PendingCommand {
            valid_from: now,
            validity_sec,
            content,
            seen_by_client: false,
            client_result: None,
        });
    }

    fn purge_expired_commands(&mut self, ip: &IpAddr, now: i64) {
        if let Some(cmds) = self.pending_commands.get_mut(ip) {
            cmds.retain(|c| !c.is_expired(now));
            if cmds.is_empty() {
                self.pending_commands.remove(ip);
            }
        }
    }

    /// PollCommand: returns (and marks `seen_by_client`) the oldest
    /// non-expired command for `ip`, purging expired ones first.
    pub fn poll_command(&mut self, ip: IpAddr, now: i64) -> Option<PendingCommand> {
        self.purge_expired_commands(&ip, now);
        let cmds = self.pending_commands.get_mut(&ip)?;
        let target = cmds.iter_mut().find(|c| !c.seen_by_client)?;
        target.seen_by_client = true;
        Some(target.clone())
    }

    /// SaveCommandResult: attaches `result` to the most recently
    /// `seen_by_client` command lacking a result.
    pub fn save_command_result(&mut self, ip: IpAddr, now: i64, result: String) -> bool {
        self.purge_expired_commands(&ip, now);
        let Some(cmds) = self.pending_commands.get_mut(&ip) else { return false };
        let target = cmds
            .iter_mut()
            .rev()
            .find(|c| c.seen_by_client && c.client_result.is_none());
        match target {
            Some(c) => {
                c.client_result = Some(result);
                true
            }
            None => false,
        }
    }
}

fn format_uuid(bytes: &[u8; 16]) -> String {
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
