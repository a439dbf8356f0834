pub mod sdk;

// 重新导出常用类型和函数，方便外部使用
pub use sdk::{
    auth::{AuthProvider, AuthState, AuthUser, HttpAuthClient, ManualAuthProvider, ValidationError},
    cache::{MemoryProfileCache, ProfileCache, SqliteProfileCache},
    catalog::{Catalog, ContentItem},
    config::ClientConfig,
    gating::Screen,
    listener::{EmptyStateListener, StateListener},
    remote::{HttpRemoteStore, MemoryRemoteStore, RemoteStore},
    types::{ContentId, Identity},
    writer::WritePolicy,
    AppState, SyncClient, SyncHandle,
};
