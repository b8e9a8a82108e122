//! 仿真核心模块
//!
//! 此模块包含离散事件仿真内核：仿真时间、事件记录、continuation、事件队列与控制器。

// 子模块声明
mod config;
mod continuation;
mod controller;
mod entity;
mod error;
mod queue;
mod record;
mod submit;
mod time;
mod trace;

// 重新导出公共接口
pub use config::{ControllerConfig, FailurePolicy};
pub use continuation::{Continuation, ContinuingCall, Sleep};
pub use controller::{Controller, ControllerState, PostKind, PostObserver, RunSummary};
pub use entity::{
    Behavior, EntityId, EntityRef, EntityReference, Handler, MethodTable, Ordinal, Outcome, arg,
    ready,
};
pub use error::{Failure, SimError, SimResult};
pub use queue::EventQueue;
pub use record::{EventRecord, RecordId};
pub use submit::{StopHandle, Submitter};
pub use time::SimTime;
pub use trace::{CausalLog, TraceSink};
