//! Priority-based slot allocation.
//!
//! Given one [`EquipmentState`] per zone and a cap `N` on simultaneously
//! active equipment, decides which zones to activate and which to shut
//! down. Pure: no I/O, no shared state, deterministic.
//!
//! Algorithm:
//! 1. Rank by `(priority desc, can_switch desc)`, stable.
//! 2. Collect shutdown candidates (running, switchable, below MAX, and
//!    either MIN or ranked beyond `N`) and activation candidates (idle,
//!    switchable, above MIN, and either MAX or ranked within `N`).
//! 3. Shed shutdown candidates lowest priority first while the projected
//!    load exceeds `N` (MIN candidates are always shed).
//! 4. Activate candidates highest priority first while slots remain (MAX
//!    candidates always).
//! 5. Re-assert running high-stage equipment and running MAX equipment.
//!
//! Every result is verified against the scheduling postconditions before
//! it is returned; a failure is an [`InvariantViolation`].

use crate::error::InvariantViolation;
use crate::types::{Action, EquipmentState, ScheduleDecision, ZoneId, MAX_PRIORITY, MIN_PRIORITY};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// Verdict for one zone, before the leader stamps it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub zone: ZoneId,
    pub action: Action,
}

impl Assignment {
    /// Turn into a decision issued by `issued_by`
    pub fn issue(self, issued_by: ZoneId, issued_at: DateTime<Utc>) -> ScheduleDecision {
        ScheduleDecision {
            target: self.zone,
            action: self.action,
            issued_by,
            issued_at,
        }
    }
}

/// Slot allocator for a fixed concurrency cap
#[derive(Debug, Clone, Copy)]
pub struct SlotAllocator {
    cap: usize,
}

impl SlotAllocator {
    pub fn new(cap: usize) -> Self {
        Self { cap }
    }

    /// Concurrency cap `N`
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Compute one assignment per zone, ordered by zone id.
    ///
    /// An empty list yields no assignments.
    pub fn allocate(
        &self,
        equipment: &[EquipmentState],
    ) -> Result<Vec<Assignment>, InvariantViolation> {
        check_input(equipment)?;

        let n = self.cap;
        let ranked = rank(equipment);
        let mut actions: BTreeMap<ZoneId, Action> =
            ranked.iter().map(|eq| (eq.id, Action::NoChange)).collect();

        let mut active_count = 0usize;
        let mut shed = Vec::new();
        let mut admit = Vec::new();

        for (idx, eq) in ranked.iter().enumerate() {
            let rank = idx + 1;
            if eq.is_on {
                active_count += 1;
            }

            if is_shutdown_candidate(eq, rank, n) {
                shed.push(eq);
            } else if is_activation_candidate(eq, rank, n) {
                admit.push(eq);
            }
        }

        // Walk order is priority-descending; shed from the bottom up.
        shed.reverse();
        let pending = admit.len();

        for eq in shed {
            if eq.priority != MIN_PRIORITY && active_count + pending <= n {
                break;
            }
            if eq.priority >= MAX_PRIORITY {
                return Err(InvariantViolation::MaxPriorityShutdown { zone: eq.id });
            }
            active_count = active_count
                .checked_sub(1)
                .ok_or(InvariantViolation::ActiveCountUnderflow { zone: eq.id })?;
            actions.insert(eq.id, Action::Shutdown);
        }

        for eq in admit {
            if eq.priority != MAX_PRIORITY && active_count >= n {
                break;
            }
            actions.insert(eq.id, Action::Activate);
            active_count += 1;
        }

        for eq in &ranked {
            if !eq.is_on || eq.priority == MIN_PRIORITY {
                continue;
            }
            let high_stage = eq.mode.is_high_intensity() && actions[&eq.id] != Action::Shutdown;
            let must_run_low_stage = eq.mode.intensity() == 1 && eq.priority == MAX_PRIORITY;
            if high_stage || must_run_low_stage {
                actions.insert(eq.id, Action::Activate);
            }
        }

        verify(&ranked, &actions, n)?;

        Ok(actions
            .into_iter()
            .map(|(zone, action)| Assignment { zone, action })
            .collect())
    }
}

/// Rank equipment by priority, preferring switchable entries at equal
/// priority. Stable with respect to input order.
pub fn rank(equipment: &[EquipmentState]) -> Vec<EquipmentState> {
    let mut ranked = equipment.to_vec();
    ranked.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.can_switch.cmp(&a.can_switch))
    });
    ranked
}

fn is_shutdown_candidate(eq: &EquipmentState, rank: usize, n: usize) -> bool {
    eq.is_on
        && eq.priority != MAX_PRIORITY
        && eq.can_switch
        && (eq.priority == MIN_PRIORITY || rank > n)
}

fn is_activation_candidate(eq: &EquipmentState, rank: usize, n: usize) -> bool {
    !eq.is_on
        && eq.priority != MIN_PRIORITY
        && eq.can_switch
        && (eq.priority == MAX_PRIORITY || rank <= n)
}

fn check_input(equipment: &[EquipmentState]) -> Result<(), InvariantViolation> {
    let mut seen = HashSet::with_capacity(equipment.len());
    for eq in equipment {
        if eq.priority > MAX_PRIORITY {
            return Err(InvariantViolation::PriorityOutOfRange {
                zone: eq.id,
                priority: eq.priority,
            });
        }
        if !seen.insert(eq.id) {
            return Err(InvariantViolation::DuplicateZone { zone: eq.id });
        }
    }
    Ok(())
}

/// Check the scheduling postconditions with the decisions applied.
fn verify(
    ranked: &[EquipmentState],
    actions: &BTreeMap<ZoneId, Action>,
    n: usize,
) -> Result<(), InvariantViolation> {
    let on_after: Vec<bool> = ranked
        .iter()
        .map(|eq| match actions[&eq.id] {
            Action::Activate => true,
            Action::Shutdown => false,
            Action::NoChange => eq.is_on,
        })
        .collect();

    for eq in ranked {
        match actions[&eq.id] {
            Action::Shutdown if eq.priority == MAX_PRIORITY => {
                return Err(InvariantViolation::MaxPriorityShutdown { zone: eq.id });
            }
            Action::Activate if eq.priority == MIN_PRIORITY => {
                return Err(InvariantViolation::MinPriorityActivation { zone: eq.id });
            }
            _ => {}
        }
    }

    let active = on_after.iter().filter(|on| **on).count();

    // A runnable device in the first N slots only stays idle when the cap
    // is already used up.
    for (idx, eq) in ranked.iter().enumerate().take(n) {
        if !on_after[idx] && eq.can_switch && eq.priority != MIN_PRIORITY && active < n {
            return Err(InvariantViolation::SlotLeftIdle {
                zone: eq.id,
                rank: idx + 1,
                active,
                cap: n,
            });
        }
    }

    // A switchable device left running beyond the first N slots must not
    // be displacing anything of higher priority that could run.
    for (idx, eq) in ranked.iter().enumerate().skip(n) {
        if !(on_after[idx] && eq.can_switch && eq.priority < MAX_PRIORITY) {
            continue;
        }
        for (slot, other) in ranked.iter().enumerate().take(n) {
            let holds = other.priority >= eq.priority
                && (other.priority == eq.priority || on_after[slot] || !other.can_switch);
            if !holds {
                return Err(InvariantViolation::OutrankedRunning {
                    zone: eq.id,
                    rank: idx + 1,
                    blocker: other.id,
                });
            }
        }
    }

    Ok(())
}
