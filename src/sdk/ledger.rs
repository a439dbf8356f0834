//! 积分账本
//!
//! 奖励只增不减：先在本地累加并写入缓存，再以客户端已知的旧值为基准派发服务端增量。

use crate::sdk::auth::ValidationError;
use crate::sdk::profile::ProfileSyncEngine;
use crate::sdk::remote::RemoteStore;
use crate::sdk::state::{Mutation, StateStore};
use crate::sdk::writer::WriteDispatcher;
use std::sync::Arc;
use tracing::info;

/// 校验奖励数额，必须为正
pub fn validate_award(amount: i64) -> Result<u64, ValidationError> {
    if amount <= 0 {
        return Err(ValidationError::NonPositiveAward);
    }
    Ok(amount as u64)
}

pub struct PointsLedger {
    remote: Arc<dyn RemoteStore>,
    writer: WriteDispatcher,
}

impl PointsLedger {
    pub fn new(remote: Arc<dyn RemoteStore>, writer: WriteDispatcher) -> Self {
        Self { remote, writer }
    }

    /// 发放积分；未登录或资料未就绪时忽略
    pub async fn award(&self, profile: &ProfileSyncEngine, store: &StateStore, amount: u64) {
        let Some(identity) = profile.identity().cloned() else {
            return;
        };
        let previous = store.current().points();
        if !profile.apply_local(store, Mutation::AddPoints(amount)).await {
            return;
        }
        info!("[Ledger] 🏅 {} 获得 {} 积分（原有 {}）", identity, amount, previous);
        let remote = self.remote.clone();
        self.writer.dispatch("increment_points", move || {
            let remote = remote.clone();
            let identity = identity.clone();
            async move { remote.increment_points(&identity, previous, amount).await }
        });
    }
}
