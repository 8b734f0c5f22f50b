//! Reassembly of fragmented payloads.
//!
//! Oversized envelopes are split by [`Envelope::split`]; this module puts
//! them back together on the receiving side. Groups are keyed by the
//! connection they arrived on plus their random group id, so two peers
//! picking the same id cannot corrupt each other's messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use switchyard_transport::ConnectionId;

use crate::messages::Fragment;
use crate::{Envelope, ProtocolError};

/// Fragmentation limits, shared by the sending and receiving side.
#[derive(Debug, Clone)]
pub struct FragmentConfig {
    /// Largest payload, in bytes, sent as a single envelope. Larger
    /// payloads are split into chunks of at most this size.
    pub threshold: usize,

    /// How long an incomplete group may wait for its remaining chunks
    /// before a sweep discards it.
    pub group_ttl: Duration,

    /// Upper bound on `total` for any one group.
    pub max_chunks: usize,

    /// How many incomplete groups one connection may have open at once.
    pub max_groups_per_origin: usize,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            threshold: 1024,
            group_ttl: Duration::from_secs(60),
            max_chunks: 65_536,
            max_groups_per_origin: 16,
        }
    }
}

#[derive(Debug)]
struct FragmentGroup {
    total: u32,
    type_name: String,
    chunks: BTreeMap<u32, String>,
    created: Instant,
}

type GroupKey = (ConnectionId, u64);

/// Collects fragment carriers until a group is complete.
///
/// Safe to share between connection tasks: the insert, the completion
/// check, and the removal of a finished group all happen under one lock,
/// so exactly one caller ever sees a given group complete.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    groups: Mutex<HashMap<GroupKey, FragmentGroup>>,
    config: FragmentConfig,
}

impl FragmentAssembler {
    pub fn new(config: FragmentConfig) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &FragmentConfig {
        &self.config
    }

    // A panic while holding the lock can only leave a half-filled group
    // behind, which the sweep cleans up.
    fn lock(&self) -> MutexGuard<'_, HashMap<GroupKey, FragmentGroup>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds one envelope received on `origin` into reassembly.
    ///
    /// Returns `Ok(None)` while the group is still incomplete and the
    /// rebuilt envelope once the last chunk arrives. Envelopes that are
    /// not fragment carriers are returned as-is.
    ///
    /// Chunks are ordered by sequence number, not arrival order. A repeated
    /// sequence number replaces the earlier slice without counting twice.
    ///
    /// # Errors
    /// [`ProtocolError::InvalidFragment`] if the carrier is malformed, its
    /// chunk is longer than `threshold`, its sequence is out of range,
    /// `total` exceeds `max_chunks`, it would open more than
    /// `max_groups_per_origin` groups, or it disagrees with chunks already
    /// received for the same group.
    pub fn handle(
        &self,
        origin: ConnectionId,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, ProtocolError> {
        if !envelope.is_fragment() {
            return Ok(Some(envelope.clone()));
        }
        let fragment: Fragment = envelope.decode()?;

        if fragment.total == 0 || fragment.total as usize > self.config.max_chunks {
            return Err(ProtocolError::InvalidFragment(format!(
                "group {:x}: total {} outside 1..={}",
                fragment.group_id, fragment.total, self.config.max_chunks
            )));
        }
        if fragment.sequence == 0 || fragment.sequence > fragment.total {
            return Err(ProtocolError::InvalidFragment(format!(
                "group {:x}: sequence {} outside 1..={}",
                fragment.group_id, fragment.sequence, fragment.total
            )));
        }

        if fragment.chunk.len() > self.config.threshold {
            return Err(ProtocolError::InvalidFragment(format!(
                "group {:x}: chunk of {} bytes exceeds threshold {}",
                fragment.group_id,
                fragment.chunk.len(),
                self.config.threshold
            )));
        }

        let key = (origin, fragment.group_id);
        let mut groups = self.lock();
        if !groups.contains_key(&key) {
            let open = groups.keys().filter(|(conn, _)| *conn == origin).count();
            if open >= self.config.max_groups_per_origin {
                return Err(ProtocolError::InvalidFragment(format!(
                    "group {:x}: {origin} already has {open} incomplete groups",
                    fragment.group_id
                )));
            }
        }
        let group = groups.entry(key).or_insert_with(|| FragmentGroup {
            total: fragment.total,
            type_name: fragment.type_name.clone(),
            chunks: BTreeMap::new(),
            created: Instant::now(),
        });
        if group.total != fragment.total || group.type_name != fragment.type_name {
            return Err(ProtocolError::InvalidFragment(format!(
                "group {:x}: chunk says {} of {} ({}), group is {} of {}",
                fragment.group_id,
                fragment.sequence,
                fragment.total,
                fragment.type_name,
                group.total,
                group.type_name
            )));
        }
        group.chunks.insert(fragment.sequence, fragment.chunk);

        if group.chunks.len() < group.total as usize {
            return Ok(None);
        }

        // Complete: take it out while still holding the lock.
        let Some(group) = groups.remove(&key) else {
            return Ok(None);
        };
        drop(groups);

        let payload: String = group.chunks.into_values().collect();
        Ok(Some(Envelope::new(
            group.type_name,
            payload,
            envelope.source().cloned(),
            envelope.targets().iter().cloned(),
        )))
    }

    /// Drops every incomplete group that arrived on `origin`. Returns how
    /// many were dropped.
    pub fn discard_origin(&self, origin: ConnectionId) -> usize {
        let mut groups = self.lock();
        let before = groups.len();
        groups.retain(|(conn, _), _| *conn != origin);
        let dropped = before - groups.len();
        if dropped > 0 {
            tracing::debug!(%origin, dropped, "discarded incomplete fragment groups");
        }
        dropped
    }

    /// Drops every group older than `group_ttl`. Returns how many were
    /// dropped.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.config.group_ttl;
        let mut groups = self.lock();
        let before = groups.len();
        groups.retain(|_, group| group.created.elapsed() < ttl);
        let dropped = before - groups.len();
        if dropped > 0 {
            tracing::debug!(dropped, "expired incomplete fragment groups");
        }
        dropped
    }

    /// Number of groups still waiting for chunks.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}
