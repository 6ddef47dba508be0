use crate::models::{CallerContext, Targeting};

impl Targeting {
    /// Return `true` if the caller satisfies every configured rule.
    ///
    /// Empty rule kinds are ignored, so an empty `Targeting` matches everybody.
    pub fn matches(&self, context: &CallerContext) -> bool {
        self.matches_user_ids(context.identity())
            && self.matches_attributes(context)
            && self.matches_segments(context)
    }

    fn matches_user_ids(&self, identity: &str) -> bool {
        self.user_ids.is_empty() || self.user_ids.iter().any(|id| id == identity)
    }

    /// Every configured attribute must be present with one of its allowed values.
    fn matches_attributes(&self, context: &CallerContext) -> bool {
        self.attributes.iter().all(|(name, allowed)| {
            context
                .attributes
                .get(name)
                .is_some_and(|value| allowed.contains(value))
        })
    }

    /// The caller must share at least one segment.
    fn matches_segments(&self, context: &CallerContext) -> bool {
        self.segments.is_empty()
            || self
                .segments
                .iter()
                .any(|segment| context.segments.contains(segment))
    }
}
