//! Server-side sessions, pending authorizations and upstream token refresh.

mod refresher;
mod store;
mod ttl;

pub use refresher::{RefreshError, SessionRefresher, UpstreamRefresher};
pub use store::{
    AuthorizationStage, ClientAuthorization, PendingAuthorization, PendingTarget, Session,
    SessionStore, UpstreamTokens, PENDING_AUTHORIZATION_TTL,
};
pub use ttl::TtlStore;
