//! Asynchronous LDAP v3 client built on tokio.
//!
//! One [`LdapConnection`] multiplexes any number of concurrent
//! operations over a single stream (plain TCP, ldaps, or StartTLS). A
//! reader task correlates every inbound envelope to the operation that
//! requested it by message id; searches stream their entries through an
//! [`OperationHandle`], and the loops in [`paging`] drive simple paged
//! results and virtual-list-view windows on top of that.
//!
//! ```no_run
//! use ldap_async_client::{LdapConnection, SearchScope};
//!
//! # async fn run() -> ldap_async_client::Result<()> {
//! let conn = LdapConnection::connect("ldap://localhost:389").await?;
//! conn.simple_bind("cn=admin,dc=example,dc=com", "secret").await?;
//! let mut search = conn
//!     .search("dc=example,dc=com", SearchScope::WholeSubtree, "(cn=a*)", &["cn"])
//!     .await?;
//! while let Some(msg) = search.next().await? {
//!     // entries, references, then the final SearchResultDone
//! }
//! conn.unbind().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod controls;
pub mod dispatcher;
pub mod error;
pub mod operation;
pub mod paging;
pub mod protocol;
pub mod transport;

pub use connection::{ConnectOptions, ConnectionState, LdapConnection, OID_WHO_AM_I};
pub use controls::{
    sort_control, PagedResultsControl, SortKey, VlvRequestControl, VlvResponseControl,
    OID_PAGED_RESULTS, OID_SORT_REQUEST, OID_VLV_REQUEST, OID_VLV_RESPONSE,
};
pub use dispatcher::OID_NOTICE_OF_DISCONNECTION;
pub use error::{LdapError, Result};
pub use operation::OperationHandle;
pub use paging::{Page, PagedSearch, VlvSearch, VlvWindow};
pub use protocol::{
    Attribute, BindAuthentication, Control, DerefAliases, Filter, LdapMessage, LdapResult,
    ModifyChange, ModifyOperation, ProtocolOp, SearchRequest, SearchResultEntry, SearchScope,
};
pub use transport::{parse_ldap_url, LdapUrl, TlsOptions, OID_START_TLS};
