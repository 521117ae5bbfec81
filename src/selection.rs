//! Eligibility rules and the random selection policy.
//!
//! Everything in this module is a pure function over in-memory snapshots:
//! candidates in, choices out. The storage transaction that surrounds a
//! selection supplies the snapshot and applies the result; nothing here
//! touches storage, so the rules are safe to re-evaluate inside a retry
//! and can be tested without a backend.
//!
//! Randomness is injected (`rand::Rng`) so tests can seed it. Production
//! callers use a thread-local RNG. Selection is a fair shuffle with a
//! prefix take, which gives every candidate equal probability; callers
//! must not depend on the order of the returned ids.

use std::collections::{BTreeSet, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::entities::{PullRequest, ReassignmentEntry, User};

/// Upper bound on reviewers picked at pull-request creation.
pub const DEFAULT_MAX_REVIEWERS: usize = 2;

/// Compute the users eligible to fill one reviewer slot.
///
/// A roster member qualifies only if every rule holds:
/// - still flagged active (the roster is normally pre-filtered, but the
///   rule is re-checked so a stale snapshot cannot slip an inactive user
///   through);
/// - not the pull-request author;
/// - not already in `assigned` (the current reviewer set, including any
///   replacement chosen earlier in the same batch);
/// - not in `excluded` (users being deactivated in the same batch).
///
/// Roster order is preserved in the result.
pub fn eligible_candidates<'a>(
    roster: &'a [User],
    author_id: &str,
    assigned: &[String],
    excluded: &HashSet<String>,
) -> Vec<&'a User> {
    roster
        .iter()
        .filter(|member| {
            member.is_active
                && member.user_id != author_id
                && !assigned.iter().any(|a| *a == member.user_id)
                && !excluded.contains(&member.user_id)
        })
        .collect()
}

/// Pick up to `max` reviewers uniformly at random without replacement.
///
/// When `candidates.len() <= max` every candidate is returned. The order
/// of the result is arbitrary.
pub fn select_initial_reviewers<R: Rng + ?Sized>(
    rng: &mut R,
    candidates: &[&User],
    max: usize,
) -> Vec<String> {
    let mut ids: Vec<String> = candidates.iter().map(|u| u.user_id.clone()).collect();
    ids.shuffle(rng);
    ids.truncate(max);
    ids
}

/// Pick one replacement uniformly at random, or `None` when the pool is
/// empty. An empty pool is not an error at this layer: the caller decides
/// whether it is a hard failure (single reassignment) or an accepted
/// vacated slot (bulk deactivation).
pub fn select_replacement<R: Rng + ?Sized>(rng: &mut R, candidates: &[&User]) -> Option<String> {
    candidates.choose(rng).map(|u| u.user_id.clone())
}

/// Plan the reassignments for a bulk deactivation.
///
/// For every open pull request and every reviewer slot held by a user in
/// `deactivating`, picks a replacement from `roster` (or vacates the slot
/// when no candidate remains) and records one entry per slot. Replacements
/// already chosen for the same pull request earlier in the batch count as
/// assigned, so one replacement is never handed two vacated slots.
///
/// The result is stably ordered: pull requests by id, slots by the
/// departing reviewer's id. Applying the plan means, per entry, removing
/// `old_reviewer` and inserting the replacement if one was found.
pub fn plan_deactivation_reassignments<R: Rng + ?Sized>(
    rng: &mut R,
    roster: &[User],
    open_prs: &[PullRequest],
    deactivating: &HashSet<String>,
) -> Vec<ReassignmentEntry> {
    let mut prs: Vec<&PullRequest> = open_prs.iter().collect();
    prs.sort_by(|a, b| a.pull_request_id.cmp(&b.pull_request_id));

    let mut entries = Vec::new();
    for pr in prs {
        // Slots vacated on this PR, in stable order.
        let vacated: BTreeSet<&String> = pr
            .assigned_reviewers
            .iter()
            .filter(|r| deactivating.contains(*r))
            .collect();
        if vacated.is_empty() {
            continue;
        }

        let mut working: Vec<String> = pr.assigned_reviewers.clone();
        for old in vacated {
            let candidates =
                eligible_candidates(roster, &pr.author_id, &working, deactivating);
            let replacement = select_replacement(rng, &candidates);

            working.retain(|r| r != old);
            match replacement {
                Some(new) => {
                    working.push(new.clone());
                    entries.push(ReassignmentEntry::replaced(&pr.pull_request_id, old, new));
                }
                None => entries.push(ReassignmentEntry::vacated(&pr.pull_request_id, old)),
            }
        }
    }
    entries
}
