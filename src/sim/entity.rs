//! 实体能力接口
//!
//! 内核只通过 `EntityReference` 与实体交互：按 ordinal 调用、按 ordinal 查询签名与参数个数。
//! 不会检查实体内部字段。

use super::controller::Controller;
use super::error::Failure;
use futures_util::future::{self, FutureExt, LocalBoxFuture};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::rc::Rc;

/// 行为编号：在目标实体的分派表里选择一个行为。
pub type Ordinal = u32;

/// 一次调用的结果：返回值或失败，二者互斥。
pub type Outcome = Result<Value, Failure>;

/// 一次行为的执行体。
///
/// 行为可以在 `Controller::post_continuing_event` / `Controller::sleep` 处挂起，
/// 之后由调度循环在恢复时刻继续 poll。
pub type Behavior = LocalBoxFuture<'static, Outcome>;

/// 实体共享句柄。
pub type EntityRef = Rc<dyn EntityReference>;

/// 已注册实体的编号，可跨线程传递（见 `Submitter`）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub(crate) usize);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// 每个被仿真的实体都要实现的能力。
pub trait EntityReference {
    /// 启动 `ordinal` 对应的行为。
    fn invoke(self: Rc<Self>, ordinal: Ordinal, arguments: Vec<Value>, ctl: Controller)
    -> Behavior;

    /// `ordinal` 对应行为的显示签名；未知 ordinal 返回 `None`。
    fn signature_for(&self, ordinal: Ordinal) -> Option<String>;

    /// `ordinal` 对应行为的参数个数；未知 ordinal 返回 `None`。
    fn arity(&self, ordinal: Ordinal) -> Option<usize>;

    /// 诊断用名称。
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// 已完成的行为。
pub fn ready(outcome: Outcome) -> Behavior {
    future::ready(outcome).boxed_local()
}

/// 取第 `index` 个参数并反序列化。
pub fn arg<T: DeserializeOwned>(arguments: &[Value], index: usize) -> Result<T, Failure> {
    let raw = arguments
        .get(index)
        .ok_or_else(|| Failure::raised(format!("missing argument #{index}")))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| Failure::raised(format!("argument #{index}: {e}")))
}

/// 分派表中的一个行为。
pub type Handler<E> = fn(Rc<E>, Vec<Value>, Controller) -> Behavior;

struct Method<E> {
    signature: &'static str,
    arity: usize,
    handler: Handler<E>,
}

/// 预先生成的分派表：ordinal 即注册顺序。
///
/// 实体通常把它放在 `static LazyLock` 里，并在 `EntityReference` 实现中转发：
///
/// ```ignore
/// static METHODS: LazyLock<MethodTable<Counter>> =
///     LazyLock::new(|| MethodTable::new().method("void Counter.bump()", 0, Counter::bump));
/// ```
pub struct MethodTable<E> {
    methods: Vec<Method<E>>,
}

impl<E: 'static> MethodTable<E> {
    pub fn new() -> Self {
        Self {
            methods: Vec::new(),
        }
    }

    /// 追加一个行为，其 ordinal 为当前表长。
    pub fn method(mut self, signature: &'static str, arity: usize, handler: Handler<E>) -> Self {
        self.methods.push(Method {
            signature,
            arity,
            handler,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn signature(&self, ordinal: Ordinal) -> Option<&'static str> {
        self.get(ordinal).map(|m| m.signature)
    }

    pub fn arity(&self, ordinal: Ordinal) -> Option<usize> {
        self.get(ordinal).map(|m| m.arity)
    }

    pub fn dispatch(
        &self,
        entity: Rc<E>,
        ordinal: Ordinal,
        arguments: Vec<Value>,
        ctl: Controller,
    ) -> Behavior {
        match self.get(ordinal) {
            Some(m) => (m.handler)(entity, arguments, ctl),
            None => ready(Err(Failure::UnknownOrdinal {
                entity: std::any::type_name::<E>().to_string(),
                ordinal,
            })),
        }
    }

    fn get(&self, ordinal: Ordinal) -> Option<&Method<E>> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| self.methods.get(i))
    }
}

impl<E: 'static> Default for MethodTable<E> {
    fn default() -> Self {
        Self::new()
    }
}
