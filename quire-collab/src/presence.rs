//! Presence for one live session: cursors, selections and section locks.
//!
//! ```text
//! cursor / selection ──► last write wins, broadcast immediately
//! lock_section       ──► one holder per section, re-lock is a no-op
//! purge(client)      ──► drops everything the client held
//! expire(ttl)        ──► drops locks older than ttl
//! ```
//!
//! None of this state is versioned; only content changes move the session
//! version.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::protocol::{ClientId, SectionLock, TextRange};

// ───────────────────────────────────────────────────────────────────
// Client colors
// ───────────────────────────────────────────────────────────────────

/// Stable, visually distinct `#rrggbb` color for a client.
///
/// Hue comes from the id; saturation and lightness are fixed so every
/// cursor stays readable on a light background.
pub fn color_for(client_id: ClientId) -> String {
    let hue = ((client_id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

// ───────────────────────────────────────────────────────────────────
// Section locks
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("section {section_id} is locked by {holder}")]
    Held { section_id: String, holder: ClientId },
    #[error("section {section_id} is held by {holder}, not the caller")]
    NotHolder { section_id: String, holder: ClientId },
    #[error("section {section_id} is not locked")]
    NotLocked { section_id: String },
}

#[derive(Debug, Clone)]
struct LockEntry {
    client_id: ClientId,
    acquired_at: DateTime<Utc>,
    /// Monotonic twin of `acquired_at`, used for expiry.
    acquired: Instant,
}

/// Presence state of one session.
#[derive(Debug, Default)]
pub struct Presence {
    cursors: BTreeMap<ClientId, usize>,
    selections: BTreeMap<ClientId, TextRange>,
    locks: BTreeMap<String, LockEntry>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cursor(&mut self, client_id: ClientId, position: usize) {
        self.cursors.insert(client_id, position);
    }

    /// `None` clears the client's selection.
    pub fn set_selection(&mut self, client_id: ClientId, range: Option<TextRange>) {
        match range {
            Some(range) => {
                self.selections.insert(client_id, range);
            }
            None => {
                self.selections.remove(&client_id);
            }
        }
    }

    pub fn cursor(&self, client_id: &ClientId) -> Option<usize> {
        self.cursors.get(client_id).copied()
    }

    pub fn selection(&self, client_id: &ClientId) -> Option<TextRange> {
        self.selections.get(client_id).copied()
    }

    pub fn cursors(&self) -> &BTreeMap<ClientId, usize> {
        &self.cursors
    }

    pub fn selections(&self) -> &BTreeMap<ClientId, TextRange> {
        &self.selections
    }

    /// Take `section_id` for `client_id`.
    ///
    /// Returns `true` when the lock is newly acquired and `false` when the
    /// caller already held it.
    pub fn lock(&mut self, section_id: &str, client_id: ClientId) -> Result<bool, LockError> {
        if let Some(entry) = self.locks.get(section_id) {
            if entry.client_id == client_id {
                return Ok(false);
            }
            return Err(LockError::Held {
                section_id: section_id.to_string(),
                holder: entry.client_id,
            });
        }
        self.locks.insert(
            section_id.to_string(),
            LockEntry { client_id, acquired_at: Utc::now(), acquired: Instant::now() },
        );
        Ok(true)
    }

    pub fn unlock(&mut self, section_id: &str, client_id: ClientId) -> Result<(), LockError> {
        match self.locks.get(section_id) {
            None => Err(LockError::NotLocked { section_id: section_id.to_string() }),
            Some(entry) if entry.client_id != client_id => Err(LockError::NotHolder {
                section_id: section_id.to_string(),
                holder: entry.client_id,
            }),
            Some(_) => {
                self.locks.remove(section_id);
                Ok(())
            }
        }
    }

    pub fn lock_holder(&self, section_id: &str) -> Option<ClientId> {
        self.locks.get(section_id).map(|e| e.client_id)
    }

    pub fn locks(&self) -> Vec<SectionLock> {
        self.locks
            .iter()
            .map(|(section_id, entry)| SectionLock {
                section_id: section_id.clone(),
                client_id: entry.client_id,
                acquired_at: entry.acquired_at,
            })
            .collect()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Drop the client's cursor, selection and locks. Returns the released
    /// section ids.
    pub fn purge(&mut self, client_id: &ClientId) -> Vec<String> {
        self.cursors.remove(client_id);
        self.selections.remove(client_id);
        let released: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, entry)| entry.client_id == *client_id)
            .map(|(section_id, _)| section_id.clone())
            .collect();
        for section_id in &released {
            self.locks.remove(section_id);
        }
        released
    }

    /// Release locks held for at least `ttl`. Returns `(section, holder)`
    /// pairs.
    pub fn expire(&mut self, ttl: Duration) -> Vec<(String, ClientId)> {
        let expired: Vec<(String, ClientId)> = self
            .locks
            .iter()
            .filter(|(_, entry)| entry.acquired.elapsed() >= ttl)
            .map(|(section_id, entry)| (section_id.clone(), entry.client_id))
            .collect();
        for (section_id, _) in &expired {
            self.locks.remove(section_id);
        }
        expired
    }
}
