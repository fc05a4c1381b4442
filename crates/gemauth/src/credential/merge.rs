// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential precedence.
//!
//! External candidates are ranked first: a source with both an access and a
//! refresh token beats a refresh-only one, and within a tier the furthest
//! `expires_at` wins (`0` is unknown and ranks last). Earlier sources win
//! ties. Non-refreshable external credentials never take part, so an import
//! can't shadow a stored refresh token with one that can't be renewed.
//!
//! The winner then competes with the persisted credential: it replaces a
//! stored credential that can't be renewed (the access-only sentinel), and
//! otherwise only one that expires strictly earlier.

use crate::credential::SourcedCredential;

/// Rank key: (has access token, expiry).
fn rank(c: &SourcedCredential) -> (bool, u64) {
    (c.credential.has_access(), c.credential.expires_at)
}

/// The most authoritative refreshable external credential.
pub fn best_external(candidates: &[SourcedCredential]) -> Option<&SourcedCredential> {
    let mut best: Option<&SourcedCredential> = None;
    for candidate in candidates.iter().filter(|c| c.credential.is_refreshable()) {
        match best {
            Some(current) if rank(candidate) <= rank(current) => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Pick the freshest credential among the persisted one and external candidates.
pub fn merge(
    persisted: Option<SourcedCredential>,
    external: &[SourcedCredential],
) -> Option<SourcedCredential> {
    let external = best_external(external).cloned();
    match (persisted, external) {
        (None, None) => None,
        (Some(stored), None) => Some(stored),
        (None, Some(ext)) => Some(ext),
        (Some(stored), Some(ext)) => {
            let key = |c: &SourcedCredential| (c.credential.is_refreshable(), c.credential.expires_at);
            if key(&ext) > key(&stored) {
                Some(ext)
            } else {
                Some(stored)
            }
        }
    }
}

#[cfg(test)]
#[path = "merge_tests.rs"]
mod tests;
