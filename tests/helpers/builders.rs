use std::path::PathBuf;

use docguard::rules::loader::load_policies;
use docguard::rules::types::{Principal, Snapshot};
use docguard::rules::RuleTable;
use serde_json::Value;

pub const ADMIN_EMAIL: &str = "admin@earnyha.com";

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Compiled referral app policy from `tests/fixtures/referral_rules.kdl`
pub fn fixture_table() -> RuleTable {
    load_policies(&fixture_path("referral_rules.kdl")).expect("fixture policy should compile")
}

pub fn user(id: &str) -> Principal {
    Principal::new(id).with_claim("email", format!("{id}@example.com"))
}

pub fn admin() -> Principal {
    Principal::new("admin").with_claim("email", ADMIN_EMAIL)
}

/// Builder for document snapshots
#[derive(Default)]
pub struct SnapshotBuilder {
    fields: Snapshot,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.fields.remove(name);
        self
    }

    /// Profile document with the three bonus counters
    pub fn profile(name: &str, balance: f64, total_earned: f64, referral_earnings: f64) -> Self {
        Self::new()
            .field("name", name)
            .field("balance", balance)
            .field("totalEarned", total_earned)
            .field("referralEarnings", referral_earnings)
    }

    pub fn build(self) -> Snapshot {
        self.fields
    }
}
