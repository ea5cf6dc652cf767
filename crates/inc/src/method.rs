//! Method registration and dispatch for the server side of a `METHOD_CALL`.
//! A handler either answers synchronously or defers: deferred calls are the
//! caller's responsibility to complete later via `Server::send_reply` using
//! the `(connection_id, sequence)` pair handed to it.

use std::collections::HashMap;
use std::sync::Mutex;

use inc_communication::TagStruct;
use inc_network::frame::ErrorCode;

pub enum MethodOutcome {
    Reply(TagStruct),
    Error(ErrorCode),
    /// The handler stored `(connection_id, sequence)` itself and will call
    /// `Server::send_reply` later.
    Deferred,
}

pub type MethodHandler =
    dyn Fn(u64, u32, &str, u16, &TagStruct) -> MethodOutcome + Send + Sync;

/// `name -> handler` registry. One table is shared by every connection a
/// `Server` owns.
#[derive(Default)]
pub struct MethodTable {
    handlers: Mutex<HashMap<String, Box<MethodHandler>>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Box<MethodHandler>) {
        self.handlers.lock().expect("method table mutex poisoned").insert(name.into(), handler);
    }

    pub fn unregister(&self, name: &str) {
        self.handlers.lock().expect("method table mutex poisoned").remove(name);
    }

    /// Invokes the registered handler for `name`, or yields `UNKNOWN_METHOD`
    /// if none is registered.
    pub fn dispatch(
        &self,
        connection_id: u64,
        sequence: u32,
        name: &str,
        version: u16,
        args: &TagStruct,
    ) -> MethodOutcome {
        let handlers = self.handlers.lock().expect("method table mutex poisoned");
        match handlers.get(name) {
            Some(handler) => handler(connection_id, sequence, name, version, args),
            None => MethodOutcome::Error(ErrorCode::UnknownMethod),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_yields_error() {
        let table = MethodTable::new();
        let outcome = table.dispatch(1, 0, "ping", 1, &TagStruct::new());
        assert!(matches!(outcome, MethodOutcome::Error(ErrorCode::UnknownMethod)));
    }

    #[test]
    fn registered_method_dispatches_synchronously() {
        let table = MethodTable::new();
        table.register(
            "echo",
            Box::new(|_conn, _seq, _name, _version, args| {
                let mut reply = TagStruct::new();
                reply.put_bytes(args.as_bytes());
                MethodOutcome::Reply(reply)
            }),
        );
        let mut args = TagStruct::new();
        args.put_u32(42);
        match table.dispatch(1, 0, "echo", 1, &args) {
            MethodOutcome::Reply(mut reply) => assert_eq!(reply.get_bytes().unwrap(), args.as_bytes()),
            _ => panic!("expected a synchronous reply"),
        }
    }
}
