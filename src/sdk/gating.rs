//! 完成度门禁
//!
//! `admitted` 是纯派生值：必修内容全部完成即放行。主界面闩锁在同一进程会话内单向闭合，
//! 之后即使取消某个必修项也不会退回引导流程；登出时随状态一起复位。

use crate::sdk::catalog::Catalog;
use crate::sdk::types::{ContentId, Identity};
use serde::Serialize;
use std::collections::BTreeSet;

/// 必修内容是否全部完成
pub fn admitted(completed: &BTreeSet<ContentId>, catalog: &Catalog) -> bool {
    catalog.mandatory_ids().is_subset(completed)
}

/// 尚未完成的必修内容
pub fn missing_mandatory<'a>(completed: &BTreeSet<ContentId>, catalog: &'a Catalog) -> Vec<&'a ContentId> {
    catalog
        .mandatory_ids()
        .iter()
        .filter(|id| !completed.contains(*id))
        .collect()
}

/// 主界面闩锁的下一个值
///
/// 只有已登录时才会闭合，冷启动缓存不会提前放行。
pub fn next_latch(unlocked: bool, admitted: bool, signed_in: bool) -> bool {
    unlocked || (admitted && signed_in)
}

/// UI 应展示的界面
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Screen {
    /// 未登录
    Visitor,
    /// 已登录，必修内容未完成
    Onboarding,
    MainApp,
}

impl Screen {
    pub fn resolve(identity: Option<&Identity>, unlocked: bool) -> Self {
        match (identity, unlocked) {
            (None, _) => Screen::Visitor,
            (Some(_), true) => Screen::MainApp,
            (Some(_), false) => Screen::Onboarding,
        }
    }
}
