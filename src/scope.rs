use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ExceptionHandler, LogExceptionHandler};
use crate::expression::{Accessor, ExpressionParser, WatchExpr};
use crate::scheduler::Scheduler;
use crate::scheduler::TaskId;
use crate::value::{
    deep_clone, deep_equals, shallow_copy, watch_equals, ObjectMap, Value,
};

/// Dirty-check passes a digest may run before giving up.
pub const DEFAULT_TTL: usize = 10;

/// Root-scope construction options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeOptions {
    pub ttl: usize,
}

impl Default for ScopeOptions {
    fn default() -> Self {
        ScopeOptions { ttl: DEFAULT_TTL }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    None,
    Digest,
    Apply,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::None => "none",
            Phase::Digest => "digest",
            Phase::Apply => "apply",
        }
    }
}

type ListenerFn = dyn Fn(&Value, &Value, &Scope);
type GroupListenerFn = dyn Fn(&[Value], &[Value], &Scope);
type EventListenerFn = dyn Fn(&ScopeEvent, &[Value]);

struct Watcher {
    id: u64,
    accessor: Accessor,
    listener: Rc<ListenerFn>,
    value_eq: bool,
    /// `None` until the first evaluation, so the first listener call
    /// always fires with `old == new`.
    last: RefCell<Option<Value>>,
}

struct AsyncTask {
    scope: Scope,
    expr: WatchExpr,
}

/// A node in the evaluation tree. Cheap to clone; all state lives
/// behind the shared inner.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

struct ScopeInner {
    id: u64,
    isolated: bool,
    /// The scope's own data map; also the value of `this` in
    /// expressions.
    data: ObjectMap,
    /// Delegation source for property reads (construction parent).
    data_parent: RefCell<Weak<ScopeInner>>,
    /// Hierarchy parent for events and digest traversal.
    parent: RefCell<Weak<ScopeInner>>,
    /// `None` on the root itself; children hold the root strongly so
    /// the tree stays alive while any handle into it exists.
    root: Option<Rc<ScopeInner>>,
    children: RefCell<Vec<Rc<ScopeInner>>>,
    /// `None` marks a destroyed scope.
    watchers: RefCell<Option<Vec<Rc<Watcher>>>>,
    listeners: RefCell<HashMap<String, Vec<Option<Rc<EventListenerFn>>>>>,
    // Queues are shared by reference with the root so enqueues from
    // anywhere in the tree converge on the same drain.
    async_queue: Rc<RefCell<VecDeque<AsyncTask>>>,
    apply_async_queue: Rc<RefCell<VecDeque<AsyncTask>>>,
    post_digest_queue: Rc<RefCell<VecDeque<Box<dyn FnOnce()>>>>,
    // Root-only state.
    phase: Cell<Phase>,
    last_dirty_watch: Cell<Option<u64>>,
    apply_async_id: Cell<Option<TaskId>>,
    ttl: usize,
    counter: Cell<u64>,
    scheduler: Rc<RefCell<Scheduler>>,
    parser: Rc<ExpressionParser>,
    handler: Rc<dyn ExceptionHandler>,
}

/// Deregistration handle for watches, groups, collections, and event
/// listeners. Dropping it leaves the registration in place.
pub struct WatchHandle {
    dereg: Rc<dyn Fn()>,
}

impl WatchHandle {
    fn new(f: impl Fn() + 'static) -> Self {
        WatchHandle { dereg: Rc::new(f) }
    }

    fn noop() -> Self {
        WatchHandle { dereg: Rc::new(|| {}) }
    }

    fn combine(handles: Vec<WatchHandle>) -> Self {
        let deregs: Vec<Rc<dyn Fn()>> = handles.into_iter().map(|h| h.dereg).collect();
        WatchHandle::new(move || {
            for dereg in &deregs {
                dereg();
            }
        })
    }

    fn dereg_rc(&self) -> Rc<dyn Fn()> {
        self.dereg.clone()
    }

    pub fn deregister(self) {
        (self.dereg)();
    }
}

impl Scope {
    pub fn new() -> Scope {
        Self::new_with(ScopeOptions::default(), Rc::new(LogExceptionHandler))
    }

    pub fn with_options(options: ScopeOptions) -> Scope {
        Self::new_with(options, Rc::new(LogExceptionHandler))
    }

    pub fn with_exception_handler(handler: Rc<dyn ExceptionHandler>) -> Scope {
        Self::new_with(ScopeOptions::default(), handler)
    }

    pub fn new_with(options: ScopeOptions, handler: Rc<dyn ExceptionHandler>) -> Scope {
        Scope {
            inner: Rc::new(ScopeInner {
                id: 0,
                isolated: false,
                data: Rc::new(RefCell::new(HashMap::new())),
                data_parent: RefCell::new(Weak::new()),
                parent: RefCell::new(Weak::new()),
                root: None,
                children: RefCell::new(Vec::new()),
                watchers: RefCell::new(Some(Vec::new())),
                listeners: RefCell::new(HashMap::new()),
                async_queue: Rc::new(RefCell::new(VecDeque::new())),
                apply_async_queue: Rc::new(RefCell::new(VecDeque::new())),
                post_digest_queue: Rc::new(RefCell::new(VecDeque::new())),
                phase: Cell::new(Phase::None),
                last_dirty_watch: Cell::new(None),
                apply_async_id: Cell::new(None),
                ttl: options.ttl,
                counter: Cell::new(1),
                scheduler: Rc::new(RefCell::new(Scheduler::new())),
                parser: Rc::new(ExpressionParser::new()),
                handler,
            }),
        }
    }

    /// Child scope whose data delegates to this scope (unless
    /// isolated) and that digests as part of this scope's subtree.
    pub fn new_child(&self, isolated: bool) -> Scope {
        self.make_child(isolated, self)
    }

    /// Child delegating data from `self` but attached under `parent`
    /// in the hierarchy.
    pub fn new_child_in(&self, isolated: bool, parent: &Scope) -> Scope {
        self.make_child(isolated, parent)
    }

    fn make_child(&self, isolated: bool, hierarchy_parent: &Scope) -> Scope {
        let root = self.root_inner();
        let inner = Rc::new(ScopeInner {
            id: next_id(&root),
            isolated,
            data: Rc::new(RefCell::new(HashMap::new())),
            data_parent: RefCell::new(Rc::downgrade(&self.inner)),
            parent: RefCell::new(Rc::downgrade(&hierarchy_parent.inner)),
            root: Some(root.clone()),
            children: RefCell::new(Vec::new()),
            watchers: RefCell::new(Some(Vec::new())),
            listeners: RefCell::new(HashMap::new()),
            async_queue: self.inner.async_queue.clone(),
            apply_async_queue: self.inner.apply_async_queue.clone(),
            post_digest_queue: self.inner.post_digest_queue.clone(),
            phase: Cell::new(Phase::None),
            last_dirty_watch: Cell::new(None),
            apply_async_id: Cell::new(None),
            ttl: root.ttl,
            counter: Cell::new(0),
            scheduler: root.scheduler.clone(),
            parser: root.parser.clone(),
            handler: root.handler.clone(),
        });
        hierarchy_parent
            .inner
            .children
            .borrow_mut()
            .push(inner.clone());
        Scope { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn root(&self) -> Scope {
        Scope { inner: self.root_inner() }
    }

    pub fn parent(&self) -> Option<Scope> {
        self.inner
            .parent
            .borrow()
            .upgrade()
            .map(|inner| Scope { inner })
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.watchers.borrow().is_none()
    }

    fn root_inner(&self) -> Rc<ScopeInner> {
        self.inner.root.clone().unwrap_or_else(|| self.inner.clone())
    }

    // Data

    /// Delegating property read: own map first, then up the
    /// construction chain. Isolated scopes do not delegate.
    pub fn get(&self, name: &str) -> Value {
        let mut current = self.inner.clone();
        loop {
            if let Some(value) = current.data.borrow().get(name) {
                return value.clone();
            }
            if current.isolated {
                return Value::Undefined;
            }
            let parent = current.data_parent.borrow().upgrade();
            match parent {
                Some(next) => current = next,
                None => return Value::Undefined,
            }
        }
    }

    /// Shadowing write into this scope's own map.
    pub fn set(&self, name: &str, value: Value) {
        self.inner.data.borrow_mut().insert(name.to_string(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.inner.data.borrow_mut().remove(name)
    }

    /// The scope's data object; `this` in the expression language.
    pub fn data_value(&self) -> Value {
        Value::Object(self.inner.data.clone())
    }

    // Watches

    pub fn watch(
        &self,
        expr: impl Into<WatchExpr>,
        listener: impl Fn(&Value, &Value, &Scope) + 'static,
    ) -> Result<WatchHandle, EngineError> {
        self.watch_impl(expr.into(), Rc::new(listener), false)
    }

    /// Deep-comparing watch: `last` is retained as a deep clone and
    /// compared structurally.
    pub fn watch_deep(
        &self,
        expr: impl Into<WatchExpr>,
        listener: impl Fn(&Value, &Value, &Scope) + 'static,
    ) -> Result<WatchHandle, EngineError> {
        self.watch_impl(expr.into(), Rc::new(listener), true)
    }

    fn watch_impl(
        &self,
        expr: WatchExpr,
        listener: Rc<ListenerFn>,
        value_eq: bool,
    ) -> Result<WatchHandle, EngineError> {
        let accessor = expr.into_accessor(&self.root_inner().parser)?;
        let mut value_eq = value_eq;
        if let Some(compiled) = accessor.compiled() {
            // A non-constant literal builds a fresh container on every
            // evaluation; identity comparison would never settle, so
            // these compare structurally.
            if compiled.literal && !compiled.constant {
                value_eq = true;
            }
            if compiled.constant {
                return Ok(self.watch_constant(accessor.clone(), listener, value_eq));
            }
            if compiled.one_time {
                let literal = compiled.literal;
                return Ok(self.watch_one_time(accessor.clone(), listener, value_eq, literal));
            }
        }
        Ok(self.register_watcher(accessor, listener, value_eq))
    }

    /// Constant expressions settle immediately: fire once, then
    /// remove the watcher.
    fn watch_constant(
        &self,
        accessor: Accessor,
        listener: Rc<ListenerFn>,
        value_eq: bool,
    ) -> WatchHandle {
        let slot: Rc<RefCell<Option<Rc<dyn Fn()>>>> = Rc::new(RefCell::new(None));
        let slot_in_listener = slot.clone();
        let wrapper = move |new: &Value, old: &Value, scope: &Scope| {
            listener(new, old, scope);
            if let Some(dereg) = slot_in_listener.borrow_mut().take() {
                dereg();
            }
        };
        let handle = self.register_watcher(accessor, Rc::new(wrapper), value_eq);
        *slot.borrow_mut() = Some(handle.dereg_rc());
        handle
    }

    /// `::` expressions deregister in a post-digest step once the
    /// value settles as defined, so the listener still sees the
    /// defining value.
    fn watch_one_time(
        &self,
        accessor: Accessor,
        listener: Rc<ListenerFn>,
        value_eq: bool,
        literal: bool,
    ) -> WatchHandle {
        let slot: Rc<RefCell<Option<Rc<dyn Fn()>>>> = Rc::new(RefCell::new(None));
        let last_seen = Rc::new(RefCell::new(Value::Undefined));
        let post_target = self.clone();
        let slot_in_listener = slot.clone();
        let wrapper = move |new: &Value, old: &Value, scope: &Scope| {
            *last_seen.borrow_mut() = new.clone();
            listener(new, old, scope);
            let settled = if literal { all_defined(new) } else { !new.is_undefined() };
            if settled {
                let last_seen = last_seen.clone();
                let slot = slot_in_listener.clone();
                post_target.post_digest(move || {
                    let still_settled = {
                        let value = last_seen.borrow();
                        if literal { all_defined(&value) } else { !value.is_undefined() }
                    };
                    if still_settled {
                        if let Some(dereg) = slot.borrow_mut().take() {
                            dereg();
                        }
                    }
                });
            }
        };
        let handle = self.register_watcher(accessor, Rc::new(wrapper), value_eq);
        *slot.borrow_mut() = Some(handle.dereg_rc());
        handle
    }

    fn register_watcher(
        &self,
        accessor: Accessor,
        listener: Rc<ListenerFn>,
        value_eq: bool,
    ) -> WatchHandle {
        let root = self.root_inner();
        let id = next_id(&root);
        let watcher = Rc::new(Watcher {
            id,
            accessor,
            listener,
            value_eq,
            last: RefCell::new(None),
        });
        {
            let mut watchers = self.inner.watchers.borrow_mut();
            match watchers.as_mut() {
                // Prepended: the back-to-front sweep then visits
                // watchers in registration order, newest last.
                Some(list) => list.insert(0, watcher),
                None => return WatchHandle::noop(),
            }
        }
        root.last_dirty_watch.set(None);

        let scope_weak = Rc::downgrade(&self.inner);
        let root_weak = Rc::downgrade(&root);
        WatchHandle::new(move || {
            if let Some(inner) = scope_weak.upgrade() {
                if let Some(list) = inner.watchers.borrow_mut().as_mut() {
                    if let Some(pos) = list.iter().position(|w| w.id == id) {
                        list.remove(pos);
                    }
                }
            }
            // The removed watcher may have been the short-circuit
            // anchor.
            if let Some(root) = root_weak.upgrade() {
                root.last_dirty_watch.set(None);
            }
        })
    }

    /// Watches N expressions with one listener that fires at most once
    /// per digest. The first invocation passes the same values slice
    /// as new and old.
    pub fn watch_group(
        &self,
        exprs: Vec<WatchExpr>,
        listener: impl Fn(&[Value], &[Value], &Scope) + 'static,
    ) -> Result<WatchHandle, EngineError> {
        let listener: Rc<GroupListenerFn> = Rc::new(listener);
        if exprs.is_empty() {
            // Zero expressions: fire exactly once, asynchronously.
            let active = Rc::new(Cell::new(true));
            let flag = active.clone();
            let fire = listener.clone();
            self.eval_async(WatchExpr::getter(move |scope| {
                if flag.get() {
                    fire(&[], &[], scope);
                }
                Value::Undefined
            }));
            return Ok(WatchHandle::new(move || active.set(false)));
        }

        let count = exprs.len();
        let new_values = Rc::new(RefCell::new(vec![Value::Undefined; count]));
        let old_values = Rc::new(RefCell::new(vec![Value::Undefined; count]));
        let scheduled = Rc::new(Cell::new(false));
        let first_run = Rc::new(Cell::new(true));
        let async_target = self.clone();

        let mut handles = Vec::with_capacity(count);
        for (index, expr) in exprs.into_iter().enumerate() {
            let new_values = new_values.clone();
            let old_values = old_values.clone();
            let scheduled = scheduled.clone();
            let first_run = first_run.clone();
            let listener = listener.clone();
            let async_target = async_target.clone();
            let handle = self.watch(expr, move |new, old, _scope| {
                new_values.borrow_mut()[index] = new.clone();
                old_values.borrow_mut()[index] = old.clone();
                if !scheduled.get() {
                    scheduled.set(true);
                    let new_values = new_values.clone();
                    let old_values = old_values.clone();
                    let scheduled = scheduled.clone();
                    let first_run = first_run.clone();
                    let listener = listener.clone();
                    async_target.eval_async(WatchExpr::getter(move |scope| {
                        scheduled.set(false);
                        let new_ref = new_values.borrow();
                        if first_run.get() {
                            first_run.set(false);
                            listener(new_ref.as_slice(), new_ref.as_slice(), scope);
                        } else {
                            listener(new_ref.as_slice(), old_values.borrow().as_slice(), scope);
                        }
                        Value::Undefined
                    }));
                }
            })?;
            handles.push(handle);
        }
        Ok(WatchHandle::combine(handles))
    }

    /// Structural collection watch: fires when elements/keys are
    /// added, removed, or replaced, without deep-comparing contents.
    pub fn watch_collection(
        &self,
        expr: impl Into<WatchExpr>,
        listener: impl Fn(&Value, &Value, &Scope) + 'static,
    ) -> Result<WatchHandle, EngineError> {
        let base = expr.into().into_accessor(&self.root_inner().parser)?;
        let state = Rc::new(RefCell::new(CollectionState {
            mirror: Mirror::Unset,
            change_count: 0,
            latest: Value::Undefined,
        }));

        let detector_state = state.clone();
        let change_detector = WatchExpr::fallible(move |scope| {
            let value = base.invoke(scope)?;
            let mut state = detector_state.borrow_mut();
            state.latest = value.clone();
            let CollectionState { mirror, change_count, .. } = &mut *state;
            detect_collection_changes(&value, mirror, change_count);
            Ok(Value::Num(state.change_count as f64))
        });

        let listener_state = state;
        let very_old = Rc::new(RefCell::new(Value::Undefined));
        let first = Rc::new(Cell::new(true));
        let user = Rc::new(listener);
        self.watch(change_detector, move |_, _, scope| {
            let latest = listener_state.borrow().latest.clone();
            if first.get() {
                first.set(false);
                user(&latest, &latest, scope);
            } else {
                let old = very_old.borrow().clone();
                user(&latest, &old, scope);
            }
            *very_old.borrow_mut() = shallow_copy(&latest);
        })
    }

    // Evaluation

    pub fn eval(&self, expr: impl Into<WatchExpr>) -> Result<Value, EngineError> {
        self.eval_expr(&expr.into())
    }

    /// Evaluation with a locals object shadowing scope properties.
    pub fn eval_with(
        &self,
        expr: impl Into<WatchExpr>,
        locals: &ObjectMap,
    ) -> Result<Value, EngineError> {
        match expr.into() {
            WatchExpr::Source(src) => {
                let compiled = self.root_inner().parser.parse(&src)?;
                compiled.eval_with(self, Some(locals))
            }
            WatchExpr::Compiled(compiled) => compiled.eval_with(self, Some(locals)),
            other => self.eval_expr(&other),
        }
    }

    fn eval_expr(&self, expr: &WatchExpr) -> Result<Value, EngineError> {
        match expr {
            WatchExpr::Source(src) => {
                let compiled = self.root_inner().parser.parse(src)?;
                compiled.eval(self)
            }
            WatchExpr::Compiled(compiled) => compiled.eval(self),
            WatchExpr::Getter(f) => Ok(f(self)),
            WatchExpr::Fallible(f) => f(self),
            WatchExpr::Noop => Ok(Value::Undefined),
        }
    }

    /// Evaluate inside the apply phase, then digest from the root.
    /// Evaluation errors go to the sink; phase and TTL errors
    /// propagate.
    pub fn apply(&self, expr: impl Into<WatchExpr>) -> Result<Value, EngineError> {
        let root = self.root_inner();
        begin_phase(&root, Phase::Apply)?;
        let expr = expr.into();
        let mut result = Value::Undefined;
        match self.eval_expr(&expr) {
            Ok(value) => result = value,
            Err(e) => root.handler.handle(&e),
        }
        clear_phase(&root);
        match self.root().digest() {
            Ok(()) => Ok(result),
            Err(e) => {
                root.handler.handle(&e);
                Err(e)
            }
        }
    }

    /// Queue evaluation inside the current (or next) digest. Outside a
    /// phase, a digest is scheduled on the next tick.
    pub fn eval_async(&self, expr: impl Into<WatchExpr>) {
        let root = self.root_inner();
        if root.phase.get() == Phase::None && root.async_queue.borrow().is_empty() {
            let weak = Rc::downgrade(&root);
            root.scheduler.borrow_mut().schedule(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if !inner.async_queue.borrow().is_empty() {
                        return (Scope { inner }).digest();
                    }
                }
                Ok(())
            }));
        }
        root.async_queue.borrow_mut().push_back(AsyncTask {
            scope: self.clone(),
            expr: expr.into(),
        });
    }

    /// Queue evaluation to be applied on a later tick; calls coalesce
    /// into one digest. A digest that starts first flushes the queue
    /// synchronously.
    pub fn apply_async(&self, expr: impl Into<WatchExpr>) {
        let root = self.root_inner();
        root.apply_async_queue.borrow_mut().push_back(AsyncTask {
            scope: self.clone(),
            expr: expr.into(),
        });
        if root.apply_async_id.get().is_none() {
            let weak = Rc::downgrade(&root);
            let id = root.scheduler.borrow_mut().schedule(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let scope = Scope { inner: inner.clone() };
                    return scope
                        .apply(WatchExpr::fallible(move |s| {
                            flush_apply_async(&s.root_inner());
                            Ok(Value::Undefined)
                        }))
                        .map(|_| ());
                }
                Ok(())
            }));
            root.apply_async_id.set(Some(id));
        }
    }

    /// Runs `f` after the current (or next) digest stabilises. Not run
    /// when the digest dies of TTL exhaustion.
    pub fn post_digest(&self, f: impl FnOnce() + 'static) {
        self.inner
            .post_digest_queue
            .borrow_mut()
            .push_back(Box::new(f));
    }

    /// Pumps the deferred-task queue standing in for the host timer.
    /// Returns whether any task ran; the first task error propagates
    /// after the batch completes.
    pub fn tick(&self) -> Result<bool, EngineError> {
        let root = self.root_inner();
        let batch = root.scheduler.borrow_mut().take_batch();
        let ran = !batch.is_empty();
        let mut first_error = None;
        for (_, task) in batch {
            if let Err(e) = task() {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(ran),
        }
    }

    /// Has scheduled work pending (timer stand-in not yet pumped).
    pub fn has_pending_tasks(&self) -> bool {
        !self.root_inner().scheduler.borrow().is_empty()
    }

    // Digest

    /// Runs dirty-check passes over this scope's subtree until no
    /// watcher reports a change and the async queue is empty, then
    /// drains the post-digest queue.
    pub fn digest(&self) -> Result<(), EngineError> {
        let root = self.root_inner();
        begin_phase(&root, Phase::Digest)?;
        root.last_dirty_watch.set(None);

        // A pending applyAsync timer is cancelled and its queue
        // flushed into this digest.
        if let Some(id) = root.apply_async_id.take() {
            root.scheduler.borrow_mut().cancel(id);
            flush_apply_async(&root);
        }

        let mut ttl = root.ttl;
        loop {
            loop {
                let task = root.async_queue.borrow_mut().pop_front();
                let Some(task) = task else { break };
                if !task.scope.is_destroyed() {
                    if let Err(e) = task.scope.eval_expr(&task.expr) {
                        root.handler.handle(&e);
                    }
                }
                root.last_dirty_watch.set(None);
            }

            let mut dirty = false;
            sweep_scope(&self.inner, &root, &mut dirty);

            if dirty || !root.async_queue.borrow().is_empty() {
                if ttl == 0 {
                    clear_phase(&root);
                    return Err(EngineError::MaxDigestIterations { ttl: root.ttl });
                }
                ttl -= 1;
            } else {
                break;
            }
        }
        clear_phase(&root);

        loop {
            let task = root.post_digest_queue.borrow_mut().pop_front();
            let Some(task) = task else { break };
            task();
        }
        Ok(())
    }

    // Events

    /// Registers an event listener; the returned handle tombstones the
    /// slot so deregistration during dispatch cannot skip a neighbour.
    pub fn on(
        &self,
        name: &str,
        listener: impl Fn(&ScopeEvent, &[Value]) + 'static,
    ) -> WatchHandle {
        let listener: Rc<EventListenerFn> = Rc::new(listener);
        self.inner
            .listeners
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push(Some(listener.clone()));

        let scope_weak = Rc::downgrade(&self.inner);
        let name = name.to_string();
        WatchHandle::new(move || {
            if let Some(inner) = scope_weak.upgrade() {
                if let Some(list) = inner.listeners.borrow_mut().get_mut(&name) {
                    for slot in list.iter_mut() {
                        let found = matches!(slot, Some(l) if Rc::ptr_eq(l, &listener));
                        if found {
                            *slot = None;
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Dispatches upward: this scope first, then each ancestor, until
    /// the root or a `stop_propagation` call.
    pub fn emit(&self, name: &str, args: &[Value]) -> Rc<ScopeEvent> {
        let event = Rc::new(ScopeEvent {
            name: name.to_string(),
            target: self.clone(),
            current: RefCell::new(None),
            default_prevented: Cell::new(false),
            stopped: Cell::new(false),
            stoppable: true,
        });
        let mut cursor = Some(self.clone());
        while let Some(scope) = cursor {
            *event.current.borrow_mut() = Some(scope.clone());
            scope.dispatch_event(name, &event, args);
            if event.stopped.get() {
                break;
            }
            cursor = scope.parent();
        }
        *event.current.borrow_mut() = None;
        event
    }

    /// Dispatches downward depth-first over the subtree. Broadcast
    /// events cannot stop propagation.
    pub fn broadcast(&self, name: &str, args: &[Value]) -> Rc<ScopeEvent> {
        let event = Rc::new(ScopeEvent {
            name: name.to_string(),
            target: self.clone(),
            current: RefCell::new(None),
            default_prevented: Cell::new(false),
            stopped: Cell::new(false),
            stoppable: false,
        });
        self.broadcast_walk(name, &event, args);
        *event.current.borrow_mut() = None;
        event
    }

    fn broadcast_walk(&self, name: &str, event: &Rc<ScopeEvent>, args: &[Value]) {
        *event.current.borrow_mut() = Some(self.clone());
        self.dispatch_event(name, event, args);
        let kids: Vec<Rc<ScopeInner>> = self.inner.children.borrow().clone();
        for kid in kids {
            (Scope { inner: kid }).broadcast_walk(name, event, args);
        }
    }

    fn dispatch_event(&self, name: &str, event: &Rc<ScopeEvent>, args: &[Value]) {
        let mut index = 0;
        loop {
            let listener = {
                let mut map = self.inner.listeners.borrow_mut();
                let Some(list) = map.get_mut(name) else { break };
                // Compact tombstones as they are encountered.
                loop {
                    if index >= list.len() {
                        break None;
                    }
                    match &list[index] {
                        None => {
                            list.remove(index);
                        }
                        Some(l) => break Some(l.clone()),
                    }
                }
            };
            let Some(listener) = listener else { break };
            listener(event, args);
            index += 1;
        }
    }

    /// Broadcasts `$destroy`, detaches from the parent, and clears
    /// watchers and listeners so the digest never re-enters this
    /// scope.
    pub fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        self.broadcast("$destroy", &[]);
        if let Some(parent) = self.parent() {
            parent
                .inner
                .children
                .borrow_mut()
                .retain(|c| !Rc::ptr_eq(c, &self.inner));
        }
        *self.inner.watchers.borrow_mut() = None;
        self.inner.listeners.borrow_mut().clear();
        self.inner.children.borrow_mut().clear();
        *self.inner.parent.borrow_mut() = Weak::new();
        *self.inner.data_parent.borrow_mut() = Weak::new();
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scope#{}", self.inner.id)
    }
}

/// Event object passed to `on` listeners.
pub struct ScopeEvent {
    name: String,
    target: Scope,
    current: RefCell<Option<Scope>>,
    default_prevented: Cell<bool>,
    stopped: Cell<bool>,
    stoppable: bool,
}

impl ScopeEvent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_scope(&self) -> Scope {
        self.target.clone()
    }

    /// The scope whose listeners are currently running; `None` once
    /// dispatch has finished.
    pub fn current_scope(&self) -> Option<Scope> {
        self.current.borrow().clone()
    }

    pub fn prevent_default(&self) {
        self.default_prevented.set(true);
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.get()
    }

    /// Halts upward propagation after the current scope. Broadcast
    /// events ignore this.
    pub fn stop_propagation(&self) {
        if self.stoppable {
            self.stopped.set(true);
        }
    }
}

fn next_id(root: &Rc<ScopeInner>) -> u64 {
    let id = root.counter.get();
    root.counter.set(id + 1);
    id
}

fn begin_phase(root: &Rc<ScopeInner>, phase: Phase) -> Result<(), EngineError> {
    if root.phase.get() != Phase::None {
        return Err(EngineError::PhaseConflict {
            active: root.phase.get().name(),
        });
    }
    root.phase.set(phase);
    Ok(())
}

fn clear_phase(root: &Rc<ScopeInner>) {
    root.phase.set(Phase::None);
}

fn flush_apply_async(root: &Rc<ScopeInner>) {
    loop {
        let task = root.apply_async_queue.borrow_mut().pop_front();
        let Some(task) = task else { break };
        if task.scope.is_destroyed() {
            continue;
        }
        if let Err(e) = task.scope.eval_expr(&task.expr) {
            root.handler.handle(&e);
        }
    }
    root.apply_async_id.set(None);
}

/// One dirty-check visit of `inner` and its subtree. The pass walks a
/// snapshot of the watcher list back to front, so the oldest
/// registration runs first and a watcher registered while the pass
/// runs is never visited by it; one deregistered mid-pass is skipped.
/// Returns true when the short-circuit aborted the walk.
fn sweep_scope(inner: &Rc<ScopeInner>, root: &Rc<ScopeInner>, dirty: &mut bool) -> bool {
    let snapshot: Vec<Rc<Watcher>> = match inner.watchers.borrow().as_ref() {
        Some(list) => list.clone(),
        None => Vec::new(),
    };
    for watcher in snapshot.iter().rev() {
        let removed = {
            let guard = inner.watchers.borrow();
            let Some(list) = guard.as_ref() else { break };
            !list.iter().any(|w| w.id == watcher.id)
        };
        if removed {
            continue;
        }
        let scope = Scope { inner: inner.clone() };
        match watcher.accessor.invoke(&scope) {
            Err(e) => root.handler.handle(&e),
            Ok(value) => {
                let last = watcher.last.borrow().clone();
                let unchanged = match &last {
                    None => false,
                    Some(prev) => {
                        if watcher.value_eq {
                            deep_equals(&value, prev)
                        } else {
                            watch_equals(&value, prev)
                        }
                    }
                };
                if !unchanged {
                    *dirty = true;
                    root.last_dirty_watch.set(Some(watcher.id));
                    let stored = if watcher.value_eq { deep_clone(&value) } else { value.clone() };
                    *watcher.last.borrow_mut() = Some(stored);
                    let old = match last {
                        None => value.clone(),
                        Some(prev) => prev,
                    };
                    (watcher.listener)(&value, &old, &scope);
                } else if root.last_dirty_watch.get() == Some(watcher.id) {
                    // Everything since the last dirty watcher came up
                    // clean; the rest of the tree cannot be dirty.
                    *dirty = false;
                    return true;
                }
            }
        }
    }

    let kids: Vec<Rc<ScopeInner>> = inner.children.borrow().clone();
    for kid in kids {
        if kid.watchers.borrow().is_none() {
            continue;
        }
        if sweep_scope(&kid, root, dirty) {
            return true;
        }
    }
    false
}

fn all_defined(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.borrow().iter().all(|v| !v.is_undefined()),
        Value::Object(map) => map.borrow().values().all(|v| !v.is_undefined()),
        other => !other.is_undefined(),
    }
}

struct CollectionState {
    mirror: Mirror,
    change_count: u64,
    latest: Value,
}

/// Incremental picture of the watched collection; the change counter
/// bumps on every structural difference from it.
enum Mirror {
    Unset,
    Primitive(Value),
    ArrayLike(Vec<Value>),
    Object(HashMap<String, Value>),
}

fn detect_collection_changes(new_value: &Value, mirror: &mut Mirror, change_count: &mut u64) {
    if new_value.is_array_like() {
        if !matches!(mirror, Mirror::ArrayLike(_)) {
            *change_count += 1;
            *mirror = Mirror::ArrayLike(Vec::new());
        }
        let Mirror::ArrayLike(old) = mirror else { unreachable!() };
        let new_items = array_like_items(new_value);
        if old.len() != new_items.len() {
            *change_count += 1;
            old.resize(new_items.len(), Value::Undefined);
        }
        for (i, item) in new_items.iter().enumerate() {
            if !watch_equals(&old[i], item) {
                *change_count += 1;
                old[i] = item.clone();
            }
        }
    } else if let Value::Object(map) = new_value {
        if !matches!(mirror, Mirror::Object(_)) {
            *change_count += 1;
            *mirror = Mirror::Object(HashMap::new());
        }
        let Mirror::Object(old) = mirror else { unreachable!() };
        let new_map = map.borrow();
        for (key, item) in new_map.iter() {
            match old.get(key) {
                Some(prev) => {
                    if !watch_equals(prev, item) {
                        *change_count += 1;
                        old.insert(key.clone(), item.clone());
                    }
                }
                None => {
                    *change_count += 1;
                    old.insert(key.clone(), item.clone());
                }
            }
        }
        if old.len() > new_map.len() {
            *change_count += 1;
            old.retain(|key, _| new_map.contains_key(key));
        }
    } else {
        let changed = match mirror {
            Mirror::Primitive(prev) => !watch_equals(prev, new_value),
            _ => true,
        };
        if changed {
            *change_count += 1;
            *mirror = Mirror::Primitive(new_value.clone());
        }
    }
}

fn array_like_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.borrow().clone(),
        Value::Object(_) => {
            let length = value.get_member("length").to_number() as usize;
            (0..length)
                .map(|i| value.get_member(&i.to_string()))
                .collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::WatchExpr;

    #[test]
    fn data_delegates_to_parent_until_shadowed() {
        let root = Scope::new();
        root.set("x", Value::Num(1.0));
        let child = root.new_child(false);
        assert_eq!(child.get("x"), Value::Num(1.0));
        child.set("x", Value::Num(2.0));
        assert_eq!(child.get("x"), Value::Num(2.0));
        assert_eq!(root.get("x"), Value::Num(1.0));
    }

    #[test]
    fn isolated_child_does_not_delegate_but_shares_queues() {
        let root = Scope::new();
        root.set("x", Value::Num(1.0));
        let isolated = root.new_child(true);
        assert!(isolated.get("x").is_undefined());
        assert!(Rc::ptr_eq(&root.inner.async_queue, &isolated.inner.async_queue));
        assert!(Rc::ptr_eq(
            &root.inner.apply_async_queue,
            &isolated.inner.apply_async_queue
        ));
    }

    #[test]
    fn digest_while_digesting_is_a_phase_conflict() {
        let root = Scope::new();
        let inner = root.clone();
        root.set("v", Value::Num(1.0));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        root.watch(
            WatchExpr::getter(|s| s.get("v")),
            move |_, _, _| {
                log.borrow_mut()
                    .push(inner.digest().expect_err("should conflict"));
            },
        )
        .expect("watch");
        root.digest().expect("digest");
        assert!(matches!(
            seen.borrow()[0],
            EngineError::PhaseConflict { active: "digest" }
        ));
    }

    #[test]
    fn destroy_detaches_and_tombstones() {
        let root = Scope::new();
        let child = root.new_child(false);
        assert_eq!(root.inner.children.borrow().len(), 1);
        child.destroy();
        assert!(child.is_destroyed());
        assert!(root.inner.children.borrow().is_empty());
        assert!(child.parent().is_none());
        // Destroyed scopes accept no watchers.
        let handle = child
            .watch(WatchExpr::getter(|_| Value::Undefined), |_, _, _| {})
            .expect("watch returns");
        handle.deregister();
    }

    #[test]
    fn scope_ids_are_unique_across_tree() {
        let root = Scope::new();
        let child = root.new_child(false);
        assert_ne!(root.id(), child.id());
        let grandchild = child.new_child(false);
        assert_ne!(child.id(), grandchild.id());
    }
}
