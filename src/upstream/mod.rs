//! External collaborators: the dashboard scraper and the analytics pass.

pub mod analytics;
pub mod fetcher;

pub use analytics::{AnalyticsComputer, MembershipAnalytics};
pub use fetcher::{DashboardFetcher, FetchError, ScriptedFetcher, UpstreamFetcher};
