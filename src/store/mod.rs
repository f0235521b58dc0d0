//! Persistence layer: libSQL-backed storage for users, messages,
//! classifications and their projections.

mod libsql_backend;
pub mod migrations;
pub mod model;

pub use libsql_backend::{MAX_SQL_PARAMS, RetryPolicy, StorageGateway, StorageSession};
pub use model::{
    Classification, Meeting, NewMessage, StoredCredentials, StoredMessage, SyncStats, Task,
    TaskStatus, UnsubscribeEntry, User,
};

#[cfg(test)]
pub(crate) use libsql_backend::tests::test_gateway;
