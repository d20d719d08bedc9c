//! Derived analytics over a stored snapshot.

use crate::core::{AnalyticsArtifact, DistrictAnalytics, Snapshot};
use chrono::Utc;

/// Pure computation invoked by analytics-generation jobs. The artefact is
/// keyed by the source snapshot and cascade-deleted with it.
pub trait AnalyticsComputer: Send + Sync {
    fn compute(&self, snapshot: &Snapshot) -> AnalyticsArtifact;
}

/// Membership-centric analytics: growth against the payment base plus a
/// distinguished flag per district.
pub struct MembershipAnalytics;

impl AnalyticsComputer for MembershipAnalytics {
    fn compute(&self, snapshot: &Snapshot) -> AnalyticsArtifact {
        let districts = snapshot
            .records
            .iter()
            .map(|r| DistrictAnalytics {
                district_id: r.district_id.clone(),
                membership: r.membership,
                growth_over_base: r.membership - r.payment_base,
                distinguished: r.membership >= r.payment_base
                    && r.distinguished_clubs * 2 >= r.active_clubs,
            })
            .collect();
        AnalyticsArtifact {
            snapshot_id: snapshot.id().to_string(),
            generated_at: Utc::now(),
            calculation_version: snapshot.metadata.calculation_version,
            districts,
        }
    }
}
