use crate::sim::{Behavior, Controller, EntityReference, Ordinal, TraceSink, ready};
use futures_util::FutureExt;
use serde_json::Value;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().expect("log lock").clone()
}

pub fn push(log: &Log, entry: impl Into<String>) {
    log.lock().expect("log lock").push(entry.into());
}

type Script = Box<dyn Fn(Vec<Value>, Controller) -> Behavior>;

/// 测试用实体：每个行为是一段闭包。
pub struct Actor {
    name: String,
    methods: Vec<(String, usize, Script)>,
}

impl Actor {
    pub fn named(name: &str) -> ActorBuilder {
        ActorBuilder {
            actor: Actor {
                name: name.to_string(),
                methods: Vec::new(),
            },
        }
    }
}

pub struct ActorBuilder {
    actor: Actor,
}

impl ActorBuilder {
    pub fn method<F>(mut self, signature: &str, arity: usize, script: F) -> Self
    where
        F: Fn(Vec<Value>, Controller) -> Behavior + 'static,
    {
        self.actor
            .methods
            .push((signature.to_string(), arity, Box::new(script)));
        self
    }

    pub fn build(self) -> Rc<Actor> {
        Rc::new(self.actor)
    }
}

impl EntityReference for Actor {
    fn invoke(
        self: Rc<Self>,
        ordinal: Ordinal,
        arguments: Vec<Value>,
        ctl: Controller,
    ) -> Behavior {
        match self.methods.get(ordinal as usize) {
            Some((_, _, script)) => script(arguments, ctl),
            None => ready(Ok(Value::Null)),
        }
    }

    fn signature_for(&self, ordinal: Ordinal) -> Option<String> {
        self.methods.get(ordinal as usize).map(|m| m.0.clone())
    }

    fn arity(&self, ordinal: Ordinal) -> Option<usize> {
        self.methods.get(ordinal as usize).map(|m| m.1)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// `void <name>.record()`：把 `<name>@<now>` 写进日志。
pub fn recorder(name: &str, log: &Log) -> Rc<Actor> {
    let log = Arc::clone(log);
    let tag = name.to_string();
    Actor::named(name)
        .method(&format!("void {name}.record()"), 0, move |_, ctl| {
            push(&log, format!("{tag}@{}", ctl.now()));
            ready(Ok(Value::Null))
        })
        .build()
}

/// 返回固定结果的实体：`String <name>.answer()`。
pub fn answering(name: &str, outcome: crate::sim::Outcome) -> Rc<Actor> {
    Actor::named(name)
        .method(&format!("String {name}.answer()"), 0, move |_, _| {
            let outcome = outcome.clone();
            async move { outcome }.boxed_local()
        })
        .build()
}

/// 可共享的内存 trace sink。
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn sink(&self) -> TraceSink {
        TraceSink::new(self.clone())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("capture lock")).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("capture lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
