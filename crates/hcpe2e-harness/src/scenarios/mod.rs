//! Built-in test scenarios.
//!
//! Each submodule exposes `tests()`; [`all`] gathers them into the order
//! `list` prints them in.

mod breakglass;
mod customer;
mod external_auth;
mod lifecycle;
mod negative;
mod shared_cluster;

pub use customer::{CustomerInfra, CUSTOMER_INFRA_TEMPLATE};
pub use negative::{expect_error_containing, MISSING_CLUSTER_NODE_POOL_ERRORS, NON_EXISTING_CLUSTER};

use crate::registry::TestCase;

pub fn all() -> Vec<TestCase> {
    let mut tests = Vec::new();
    tests.extend(lifecycle::tests());
    tests.extend(external_auth::tests());
    tests.extend(negative::tests());
    tests.extend(shared_cluster::tests());
    tests.extend(breakglass::tests());
    tests
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique_and_labelled() {
        let tests = all();
        let names: HashSet<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), tests.len());
        for t in &tests {
            assert!(
                t.labels.is_self_provisioning() || t.labels.requires_shared_cluster(),
                "{} has no environment requirement label",
                t.name
            );
        }
    }
}
