//! Per-organization feature gates and usage counters.

use crate::{
    error::{NexoError, NexoResult},
    org_config::{Feature, FeatureConfig},
    service::ServiceContext,
    types::OrgId,
};

pub struct UsageService<'a> {
    cx: ServiceContext<'a>,
}

impl<'a> UsageService<'a> {
    pub fn new(cx: ServiceContext<'a>) -> Self {
        Self { cx }
    }

    fn feature_config(&self, feature: Feature, org_id: OrgId) -> NexoResult<FeatureConfig> {
        let config = self
            .cx
            .store
            .org_config(org_id, self.cx.now())?
            .ok_or_else(|| NexoError::not_found("organization config"))?;
        Ok(config.features.get(feature))
    }

    /// Fails when the feature is off or its limit is used up.
    pub fn check_limits(&self, feature: Feature, org_id: OrgId) -> NexoResult<()> {
        let config = self.feature_config(feature, org_id)?;
        if !config.enabled {
            return Err(NexoError::FeatureDisabled { feature: feature.to_string() });
        }
        if config.limit > 0 {
            let used = self.cx.store.feature_usage(org_id, feature.as_str())?;
            if used >= config.limit {
                return Err(NexoError::LimitReached { feature: feature.to_string() });
            }
        }
        Ok(())
    }

    /// Only limited features are counted. Returns the counter afterwards.
    pub fn increase(&self, feature: Feature, org_id: OrgId) -> NexoResult<i64> {
        let config = self.feature_config(feature, org_id)?;
        if config.limit > 0 {
            return self.cx.store.increment_feature_usage(org_id, feature.as_str());
        }
        self.usage(feature, org_id)
    }

    /// Always decrements, whatever the current limit, so seats taken while a
    /// limit was set are given back after it is lifted. Never below zero.
    pub fn decrease(&self, feature: Feature, org_id: OrgId) -> NexoResult<i64> {
        self.cx.store.decrement_feature_usage(org_id, feature.as_str())
    }

    pub fn usage(&self, feature: Feature, org_id: OrgId) -> NexoResult<i64> {
        self.cx.store.feature_usage(org_id, feature.as_str())
    }
}
