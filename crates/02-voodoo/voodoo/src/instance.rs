//! Instances: local objects made invocable by method id, and the per
//! connection registry that hands out their ids.

use crate::manager::Manager;
use crate::message::{ArgReader, ArgWriter, InstanceId, MethodId, SUPER_INSTANCE};
use fusion::{FusionError, FusionResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One incoming request as seen by a method handler.
pub struct Invocation<'a> {
    manager: &'a Manager,
    instance: InstanceId,
    method: MethodId,
    args: ArgReader<'a>,
    reply: ArgWriter,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(
        manager: &'a Manager,
        instance: InstanceId,
        method: MethodId,
        payload: &'a [u8],
    ) -> Self {
        Self {
            manager,
            instance,
            method,
            args: ArgReader::new(payload),
            reply: ArgWriter::new(),
        }
    }

    /// The connection the request arrived on; handlers may issue nested
    /// requests through it.
    pub fn manager(&self) -> &'a Manager {
        self.manager
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn args(&mut self) -> &mut ArgReader<'a> {
        &mut self.args
    }

    /// Return values, sent back if the caller asked for a response.
    pub fn reply(&mut self) -> &mut ArgWriter {
        &mut self.reply
    }

    pub(crate) fn into_reply(mut self) -> Vec<u8> {
        self.reply.finish()
    }
}

type Method<T> = Arc<dyn Fn(&T, &mut Invocation<'_>) -> FusionResult<()> + Send + Sync>;

/// Maps method ids to handlers over an object of type `T`.
pub struct DispatchTable<T> {
    methods: HashMap<MethodId, Method<T>>,
}

impl<T> Default for DispatchTable<T> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }
}

impl<T> DispatchTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(
        mut self,
        id: MethodId,
        handler: impl Fn(&T, &mut Invocation<'_>) -> FusionResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(id, Arc::new(handler));
        self
    }
}

/// Type-erased registered instance.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, invocation: &mut Invocation<'_>) -> FusionResult<()>;
}

struct Registered<T> {
    object: Arc<T>,
    table: DispatchTable<T>,
}

impl<T: Send + Sync> Dispatch for Registered<T> {
    fn dispatch(&self, invocation: &mut Invocation<'_>) -> FusionResult<()> {
        let method = invocation.method();
        let handler = self
            .table
            .methods
            .get(&method)
            .ok_or(FusionError::NoSuchMethod(method))?;
        handler(&self.object, invocation)
    }
}

pub(crate) fn erase<T: Send + Sync + 'static>(
    object: Arc<T>,
    table: DispatchTable<T>,
) -> Arc<dyn Dispatch> {
    Arc::new(Registered { object, table })
}

/// Instances registered on one connection. Ids start after
/// [`SUPER_INSTANCE`] and are not reused while the connection lives.
#[derive(Default)]
pub(crate) struct InstanceRegistry {
    next: InstanceId,
    instances: HashMap<InstanceId, Arc<dyn Dispatch>>,
}

impl InstanceRegistry {
    pub(crate) fn register(&mut self, instance: Arc<dyn Dispatch>) -> FusionResult<InstanceId> {
        let id = self.next.max(SUPER_INSTANCE) + 1;
        if id == InstanceId::MAX {
            return Err(FusionError::Limit("instance ids exhausted"));
        }
        self.next = id;
        self.instances.insert(id, instance);
        Ok(id)
    }

    pub(crate) fn unregister(&mut self, id: InstanceId) -> FusionResult<()> {
        self.instances
            .remove(&id)
            .map(drop)
            .ok_or(FusionError::NoSuchInstance(id))
    }

    pub(crate) fn get(&self, id: InstanceId) -> FusionResult<Arc<dyn Dispatch>> {
        self.instances
            .get(&id)
            .cloned()
            .ok_or(FusionError::NoSuchInstance(id))
    }

    pub(crate) fn len(&self) -> usize {
        self.instances.len()
    }
}

type SuperFactory = Arc<dyn Fn(&Manager) -> FusionResult<InstanceId> + Send + Sync>;

/// Named root instances a serving side can construct on demand. Shared by
/// every connection of a server.
#[derive(Clone, Default)]
pub struct SuperRegistry {
    factories: Arc<Mutex<HashMap<String, SuperFactory>>>,
}

impl std::fmt::Debug for SuperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.factories.lock().keys().cloned().collect();
        f.debug_struct("SuperRegistry").field("names", &names).finish()
    }
}

impl SuperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `factory` under `name`. It runs once per connection, the
    /// first time a peer looks the name up, and must register the instance
    /// on the manager it is given.
    pub fn register(
        &self,
        name: &str,
        factory: impl Fn(&Manager) -> FusionResult<InstanceId> + Send + Sync + 'static,
    ) -> FusionResult<()> {
        let mut factories = self.factories.lock();
        if factories.contains_key(name) {
            return Err(FusionError::Busy);
        }
        factories.insert(name.to_owned(), Arc::new(factory));
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<SuperFactory> {
        self.factories.lock().get(name).cloned()
    }
}
