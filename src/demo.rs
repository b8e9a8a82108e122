//! 演示和示例代码
//!
//! 一对实体：`Caller` 通过 continuing call 向 `Responder` 逐轮请求应答，
//! 每轮之间阻塞睡眠，并把应答以普通事件转发回 `Responder` 记录。

use crate::sim::{
    Behavior, Controller, EntityId, EntityRef, EntityReference, Failure, MethodTable, Ordinal,
    SimTime, arg,
};
use futures_util::FutureExt;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::LazyLock;
use tracing::{debug, info};

static RESPONDER_METHODS: LazyLock<MethodTable<Responder>> = LazyLock::new(|| {
    MethodTable::new()
        .method("String Responder.pong(long)", 1, Responder::pong)
        .method("void Responder.note(String)", 1, Responder::note)
});

static CALLER_METHODS: LazyLock<MethodTable<Caller>> = LazyLock::new(|| {
    MethodTable::new().method("long Caller.play(long, long)", 2, Caller::play)
});

/// 应答方：`fail_at` 那一轮拒绝应答。
#[derive(Debug, Default)]
pub struct Responder {
    fail_at: Option<u64>,
    notes: RefCell<Vec<String>>,
}

impl Responder {
    pub const PONG: Ordinal = 0;
    pub const NOTE: Ordinal = 1;

    pub fn new(fail_at: Option<u64>) -> Rc<Self> {
        Rc::new(Self {
            fail_at,
            notes: RefCell::default(),
        })
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.borrow().clone()
    }

    fn pong(me: Rc<Self>, args: Vec<Value>, _ctl: Controller) -> Behavior {
        async move {
            let round: u64 = arg(&args, 0)?;
            if me.fail_at == Some(round) {
                return Err(Failure::raised(format!("responder refused round {round}")));
            }
            Ok::<Value, Failure>(json!(format!("pong-{round}")))
        }
        .boxed_local()
    }

    fn note(me: Rc<Self>, args: Vec<Value>, _ctl: Controller) -> Behavior {
        async move {
            let text: String = arg(&args, 0)?;
            me.notes.borrow_mut().push(text);
            Ok::<Value, Failure>(Value::Null)
        }
        .boxed_local()
    }
}

impl EntityReference for Responder {
    fn invoke(
        self: Rc<Self>,
        ordinal: Ordinal,
        arguments: Vec<Value>,
        ctl: Controller,
    ) -> Behavior {
        RESPONDER_METHODS.dispatch(self, ordinal, arguments, ctl)
    }

    fn signature_for(&self, ordinal: Ordinal) -> Option<String> {
        RESPONDER_METHODS.signature(ordinal).map(str::to_string)
    }

    fn arity(&self, ordinal: Ordinal) -> Option<usize> {
        RESPONDER_METHODS.arity(ordinal)
    }

    fn name(&self) -> &str {
        "Responder"
    }
}

/// 发起方。
pub struct Caller {
    responder: EntityRef,
    replies: RefCell<Vec<String>>,
}

impl Caller {
    pub const PLAY: Ordinal = 0;

    pub fn new(responder: EntityRef) -> Rc<Self> {
        Rc::new(Self {
            responder,
            replies: RefCell::default(),
        })
    }

    pub fn replies(&self) -> Vec<String> {
        self.replies.borrow().clone()
    }

    /// `play(rounds, gap)`：返回完成的轮数。
    fn play(me: Rc<Self>, args: Vec<Value>, ctl: Controller) -> Behavior {
        async move {
            let rounds: u64 = arg(&args, 0)?;
            let gap = SimTime(arg(&args, 1)?);
            for round in 0..rounds {
                let reply = ctl
                    .post_continuing_event(
                        Rc::clone(&me.responder),
                        Responder::PONG,
                        vec![json!(round)],
                    )
                    .await?;
                let reply = reply.as_str().unwrap_or_default().to_string();
                debug!(round, reply = %reply, now = ?ctl.now(), "收到应答");

                ctl.post_event(Rc::clone(&me.responder), Responder::NOTE, vec![json!(reply)]);
                me.replies.borrow_mut().push(reply);
                ctl.sleep(gap).await?;
            }
            info!(rounds, now = ?ctl.now(), "对话结束");
            Ok::<Value, Failure>(json!(rounds))
        }
        .boxed_local()
    }
}

impl EntityReference for Caller {
    fn invoke(
        self: Rc<Self>,
        ordinal: Ordinal,
        arguments: Vec<Value>,
        ctl: Controller,
    ) -> Behavior {
        CALLER_METHODS.dispatch(self, ordinal, arguments, ctl)
    }

    fn signature_for(&self, ordinal: Ordinal) -> Option<String> {
        CALLER_METHODS.signature(ordinal).map(str::to_string)
    }

    fn arity(&self, ordinal: Ordinal) -> Option<usize> {
        CALLER_METHODS.arity(ordinal)
    }

    fn name(&self) -> &str {
        "Caller"
    }
}

/// ping-pong 场景配置
#[derive(Debug, Clone)]
pub struct PingPongOpts {
    pub rounds: u64,
    pub gap: SimTime,
    pub fail_at: Option<u64>,
    pub start: SimTime,
}

impl Default for PingPongOpts {
    fn default() -> Self {
        Self {
            rounds: 3,
            gap: SimTime(10),
            fail_at: None,
            start: SimTime::ZERO,
        }
    }
}

/// 已搭好的场景。
pub struct PingPong {
    pub caller: Rc<Caller>,
    pub responder: Rc<Responder>,
    pub caller_id: EntityId,
    pub responder_id: EntityId,
}

/// 注册两个实体，并在 `opts.start` 投递一次 `Caller.play`。
pub fn build_ping_pong(ctl: &Controller, opts: &PingPongOpts) -> PingPong {
    let responder = Responder::new(opts.fail_at);
    let caller = Caller::new(responder.clone());
    let responder_id = ctl.register(responder.clone());
    let caller_id = ctl.register(caller.clone());

    ctl.post_labeled_event(
        "driver",
        opts.start,
        caller.clone(),
        Caller::PLAY,
        vec![json!(opts.rounds), json!(opts.gap.0)],
    );

    PingPong {
        caller,
        responder,
        caller_id,
        responder_id,
    }
}
