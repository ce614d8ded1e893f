use std::sync::Arc;
use std::time::Duration;

use crate::marshal::Marshaler;
use crate::rewrite::HeaderRewriter;
use crate::transform::BodyTransformer;
use crate::validate::Validator;

/// The retention and storage rules a matcher attaches to a request: how
/// long an artifact stays fresh, how its head and body are rewritten on the
/// write path, how it is wrapped on disk, and how the produced response is
/// validated. A zero TTL means the artifact never expires.
///
/// Policies are frozen when the cache is built; afterwards they are only
/// cloned (all members are shared).
#[derive(Clone, Default)]
pub struct Policy {
    pub ttl: Duration,
    pub header_rewriters: Vec<Arc<dyn HeaderRewriter>>,
    pub body_transformers: Vec<Arc<dyn BodyTransformer>>,
    pub marshaler: Option<Arc<dyn Marshaler>>,
    pub validator: Option<Arc<dyn Validator>>,
}

impl Policy {
    /// Folds the default matcher's policy into this one: TTL and marshaler
    /// fill in when unset, transformer lists concatenate with the defaults
    /// first. Validators do not propagate.
    pub(crate) fn inherit(&mut self, base: &Policy) {
        if self.ttl.is_zero() {
            self.ttl = base.ttl;
        }
        let mut rewriters = base.header_rewriters.clone();
        rewriters.append(&mut self.header_rewriters);
        self.header_rewriters = rewriters;

        let mut transformers = base.body_transformers.clone();
        transformers.append(&mut self.body_transformers);
        self.body_transformers = transformers;

        if self.marshaler.is_none() {
            self.marshaler = base.marshaler.clone();
        }
    }
}
