// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Serial container for a chain of data processors ([`Pipe`]s).
//!
//! A [`Pipeline`] is full duplex: reading (inbound, from the peer) and
//! writing (outbound, to the peer) happen concurrently on two worker tasks,
//! but each direction processes one object at a time. Objects fed with
//! [`read`][`PipelineHandle::read`] traverse the chain from the outbound end
//! towards the inbound end, objects fed with
//! [`write`][`PipelineHandle::write`] traverse it the other way round;
//! whatever leaves the chain is published on the corresponding stream if it
//! is of the pipeline's item type, and silently discarded otherwise.
//!
//! Pipes can be added, removed and replaced while traffic is flowing:
//! structural changes take an exclusive lock that both workers respect, and
//! run on background tasks so that a pipe may reconfigure its own pipeline
//! from inside a hook. A pipe must not *await* the completion of such a
//! change from inside a hook, otherwise it deadlocks with its own worker.

use core::any::Any;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{oneshot, watch, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::reactive::{Publisher, Subscription};

/// A dynamically typed object travelling through a pipeline.
pub type Object = Box<dyn Any + Send>;

/// Traversal direction of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the peer towards the application (`read`).
    Inbound,
    /// From the application towards the peer (`write`).
    Outbound,
}

/// States of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No worker tasks are running.
    Stopped,
    /// Reader and writer tasks are processing the queues.
    Running,
}

/// Event emitted by a [`Pipeline`].
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// An error escaped every pipe of the given direction.
    ExceptionCaught {
        /// Direction the failing object was travelling in.
        direction: Direction,
        /// The unhandled error.
        error: Error,
    },
}

/// Error of a structural pipeline mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A pipe with this name already exists.
    NameCollision(String),
    /// No pipe with this name exists.
    NoSuchEntry(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::NameCollision(name) => write!(f, "name collision: {}", name),
            PipelineError::NoSuchEntry(name) => write!(f, "no such pipe: {}", name),
        }
    }
}

impl StdError for PipelineError {}

/// A data processor that can be plugged into a [`Pipeline`].
///
/// The default processing hooks forward every object unchanged, and the
/// default exception hooks rethrow; implementations override what they need.
/// Hooks run on the pipeline's worker tasks and must not block for long.
pub trait Pipe: Send + Sync + 'static {
    /// Invoked for each object travelling towards the inbound end. Push
    /// zero or more successor objects into `out`; pushing none drops the
    /// object.
    fn on_reading(
        &self,
        pipeline: &PipelineHandle,
        obj: Object,
        out: &mut Vec<Object>,
    ) -> Result<(), Error> {
        let _ = pipeline;
        out.push(obj);
        Ok(())
    }

    /// Invoked for each object travelling towards the outbound end.
    fn on_writing(
        &self,
        pipeline: &PipelineHandle,
        obj: Object,
        out: &mut Vec<Object>,
    ) -> Result<(), Error> {
        let _ = pipeline;
        out.push(obj);
        Ok(())
    }

    /// Invoked after this pipe has been inserted into a pipeline.
    fn on_added(&self, pipeline: &PipelineHandle) {
        let _ = pipeline;
    }

    /// Invoked after this pipe has been removed from a pipeline.
    fn on_removed(&self, pipeline: &PipelineHandle) {
        let _ = pipeline;
    }

    /// Invoked when a pipe closer to the outbound end failed while reading.
    /// Returning `Ok(())` swallows the error, returning an error passes it
    /// on towards the inbound end.
    fn catch_inbound_exception(
        &self,
        pipeline: &PipelineHandle,
        cause: Error,
    ) -> Result<(), Error> {
        let _ = pipeline;
        Err(cause)
    }

    /// Counterpart of [`catch_inbound_exception`][`Pipe::catch_inbound_exception`]
    /// for the writing direction.
    fn catch_outbound_exception(
        &self,
        pipeline: &PipelineHandle,
        cause: Error,
    ) -> Result<(), Error> {
        let _ = pipeline;
        Err(cause)
    }
}

impl fmt::Debug for dyn Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn Pipe>")
    }
}

/// A pipe that does nothing: every object passes through unchanged. Useful
/// as a placeholder for a named slot.
pub struct BlankPipe;

impl Pipe for BlankPipe {}

struct Entry {
    name: Option<String>,
    pipe: Arc<dyn Pipe>,
}

/// An unbounded queue the worker blocks on.
struct Queue {
    items: StdMutex<VecDeque<Object>>,
    notify: Notify,
}

impl Queue {
    fn new() -> Queue {
        Queue {
            items: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, obj: Object) {
        self.items
            .lock()
            .expect("queue lock poisoned")
            .push_back(obj);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Object {
        loop {
            if let Some(obj) = self.items.lock().expect("queue lock poisoned").pop_front() {
                return obj;
            }
            self.notify.notified().await;
        }
    }

    fn clear(&self) {
        self.items.lock().expect("queue lock poisoned").clear();
    }
}

struct Inner {
    entries: RwLock<Vec<Entry>>,
    read_queue: Queue,
    write_queue: Queue,
    state: watch::Sender<State>,
    events: Publisher<PipelineEvent>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

/// Completion receipt of a structural mutation.
///
/// Awaiting it yields the mutation's outcome, or `None` when the pipeline
/// went away before the mutation ran. Dropping the receipt does not cancel
/// the mutation, so fire-and-forget use from inside pipe hooks is fine (and
/// awaiting it from inside a hook is exactly the deadlock described on
/// [`Pipeline`]).
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Completion<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// Cheap clone handed to [`Pipe`] hooks: everything a pipe may do to its
/// pipeline without knowing the terminal item types.
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<Inner>,
}

impl PipelineHandle {
    /// Feeds an object at the outbound end, to travel inbound.
    pub fn read<T: Any + Send>(&self, obj: T) {
        self.inner.read_queue.push(Box::new(obj));
    }

    /// Feeds an object at the inbound end, to travel outbound.
    pub fn write<T: Any + Send>(&self, obj: T) {
        self.inner.write_queue.push(Box::new(obj));
    }

    /// Drops everything still sitting in the read and write queues.
    pub fn clear_queues(&self) {
        self.inner.read_queue.clear();
        self.inner.write_queue.clear();
    }

    /// Gets the current state.
    pub fn current_state(&self) -> State {
        *self.inner.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn state(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    /// Subscribes to pipeline events.
    pub fn events(&self) -> Subscription<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Stops the worker tasks immediately. Objects being processed at the
    /// time are abandoned; queued objects stay queued.
    pub fn stop_now(&self) {
        let mut workers = self.inner.workers.lock().expect("worker lock poisoned");
        if *self.inner.state.borrow() == State::Stopped {
            return;
        }
        for worker in workers.drain(..) {
            worker.abort();
        }
        self.inner.state.send_replace(State::Stopped);
        log::debug!("pipeline stopped");
    }

    /// Looks up a pipe by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Pipe>> {
        let entries = self.inner.entries.read().await;
        entries
            .iter()
            .find(|entry| entry.name.as_deref() == Some(name))
            .map(|entry| entry.pipe.clone())
    }

    /// Lists the entry names from the outbound end to the inbound end.
    pub async fn names(&self) -> Vec<Option<String>> {
        let entries = self.inner.entries.read().await;
        entries.iter().map(|entry| entry.name.clone()).collect()
    }

    fn mutate<T, F>(&self, mutation: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&PipelineHandle, &mut Vec<Entry>) -> T + Send + 'static,
    {
        let handle = self.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut entries = handle.inner.entries.write().await;
            let outcome = mutation(&handle, &mut entries);
            drop(entries);
            let _ = tx.send(outcome);
        });
        Completion { rx }
    }

    fn check_name(entries: &[Entry], name: Option<&str>) -> Result<(), PipelineError> {
        if let Some(name) = name {
            if entries
                .iter()
                .any(|entry| entry.name.as_deref() == Some(name))
            {
                return Err(PipelineError::NameCollision(name.to_owned()));
            }
        }
        Ok(())
    }

    fn position(entries: &[Entry], name: &str) -> Result<usize, PipelineError> {
        entries
            .iter()
            .position(|entry| entry.name.as_deref() == Some(name))
            .ok_or_else(|| PipelineError::NoSuchEntry(name.to_owned()))
    }

    /// Schedules appending a pipe at the inbound end.
    pub fn add_at_inbound_end(
        &self,
        name: Option<&str>,
        pipe: Arc<dyn Pipe>,
    ) -> Completion<Result<(), PipelineError>> {
        let name = name.map(str::to_owned);
        self.mutate(move |handle, entries| {
            Self::check_name(entries, name.as_deref())?;
            entries.push(Entry {
                name,
                pipe: pipe.clone(),
            });
            pipe.on_added(handle);
            Ok(())
        })
    }

    /// Schedules prepending a pipe at the outbound end.
    pub fn add_at_outbound_end(
        &self,
        name: Option<&str>,
        pipe: Arc<dyn Pipe>,
    ) -> Completion<Result<(), PipelineError>> {
        let name = name.map(str::to_owned);
        self.mutate(move |handle, entries| {
            Self::check_name(entries, name.as_deref())?;
            entries.insert(
                0,
                Entry {
                    name,
                    pipe: pipe.clone(),
                },
            );
            pipe.on_added(handle);
            Ok(())
        })
    }

    /// Schedules inserting a pipe right after (towards the inbound end of)
    /// the named anchor pipe.
    pub fn add_towards_inbound_end(
        &self,
        anchor: &str,
        name: Option<&str>,
        pipe: Arc<dyn Pipe>,
    ) -> Completion<Result<(), PipelineError>> {
        let anchor = anchor.to_owned();
        let name = name.map(str::to_owned);
        self.mutate(move |handle, entries| {
            Self::check_name(entries, name.as_deref())?;
            let position = Self::position(entries, &anchor)?;
            entries.insert(
                position + 1,
                Entry {
                    name,
                    pipe: pipe.clone(),
                },
            );
            pipe.on_added(handle);
            Ok(())
        })
    }

    /// Schedules inserting a pipe right before (towards the outbound end of)
    /// the named anchor pipe.
    pub fn add_towards_outbound_end(
        &self,
        anchor: &str,
        name: Option<&str>,
        pipe: Arc<dyn Pipe>,
    ) -> Completion<Result<(), PipelineError>> {
        let anchor = anchor.to_owned();
        let name = name.map(str::to_owned);
        self.mutate(move |handle, entries| {
            Self::check_name(entries, name.as_deref())?;
            let position = Self::position(entries, &anchor)?;
            entries.insert(
                position,
                Entry {
                    name,
                    pipe: pipe.clone(),
                },
            );
            pipe.on_added(handle);
            Ok(())
        })
    }

    /// Schedules removing the named pipe, yielding it on success.
    pub fn remove(&self, name: &str) -> Completion<Result<Arc<dyn Pipe>, PipelineError>> {
        let name = name.to_owned();
        self.mutate(move |handle, entries| {
            let position = Self::position(entries, &name)?;
            let entry = entries.remove(position);
            entry.pipe.on_removed(handle);
            Ok(entry.pipe)
        })
    }

    /// Schedules removing every pipe.
    pub fn remove_all(&self) -> Completion<()> {
        self.mutate(move |handle, entries| {
            for entry in entries.drain(..) {
                entry.pipe.on_removed(handle);
            }
        })
    }

    /// Schedules replacing the named pipe, keeping the name. Yields the
    /// replaced pipe on success.
    pub fn replace(
        &self,
        name: &str,
        pipe: Arc<dyn Pipe>,
    ) -> Completion<Result<Arc<dyn Pipe>, PipelineError>> {
        let name = name.to_owned();
        self.mutate(move |handle, entries| {
            let position = Self::position(entries, &name)?;
            let old = core::mem::replace(&mut entries[position].pipe, pipe.clone());
            old.on_removed(handle);
            pipe.on_added(handle);
            Ok(old)
        })
    }
}

/// The duplex pipe chain. `I` is the item type of the inbound stream, `O`
/// the item type of the outbound stream.
pub struct Pipeline<I: Clone, O: Clone> {
    handle: PipelineHandle,
    inbound: Arc<Publisher<I>>,
    outbound: Arc<Publisher<O>>,
}

impl<I, O> Pipeline<I, O>
where
    I: Any + Clone + Send + 'static,
    O: Any + Clone + Send + 'static,
{
    /// Creates an empty, stopped pipeline.
    pub fn new() -> Pipeline<I, O> {
        let (state, _) = watch::channel(State::Stopped);
        Pipeline {
            handle: PipelineHandle {
                inner: Arc::new(Inner {
                    entries: RwLock::new(Vec::new()),
                    read_queue: Queue::new(),
                    write_queue: Queue::new(),
                    state,
                    events: Publisher::new(),
                    workers: StdMutex::new(Vec::new()),
                }),
            },
            inbound: Arc::new(Publisher::new()),
            outbound: Arc::new(Publisher::new()),
        }
    }

    /// Gets the type-erased handle shared with the pipes.
    pub fn handle(&self) -> &PipelineHandle {
        &self.handle
    }

    /// Starts the reader and writer tasks. Does nothing if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let inner = &self.handle.inner;
        let mut workers = inner.workers.lock().expect("worker lock poisoned");
        if *inner.state.borrow() == State::Running {
            return;
        }
        workers.push(tokio::spawn(worker_loop(
            self.handle.clone(),
            Direction::Inbound,
            self.inbound.clone(),
        )));
        workers.push(tokio::spawn(worker_loop(
            self.handle.clone(),
            Direction::Outbound,
            self.outbound.clone(),
        )));
        inner.state.send_replace(State::Running);
        log::debug!("pipeline started");
    }

    /// Subscribes to objects leaving the inbound end.
    pub fn inbound_stream(&self) -> Subscription<I> {
        self.inbound.subscribe()
    }

    /// Subscribes to objects leaving the outbound end.
    pub fn outbound_stream(&self) -> Subscription<O> {
        self.outbound.subscribe()
    }
}

impl<I, O> Default for Pipeline<I, O>
where
    I: Any + Clone + Send + 'static,
    O: Any + Clone + Send + 'static,
{
    fn default() -> Pipeline<I, O> {
        Pipeline::new()
    }
}

impl<I: Clone, O: Clone> Drop for Pipeline<I, O> {
    fn drop(&mut self) {
        let mut workers = self
            .handle
            .inner
            .workers
            .lock()
            .expect("worker lock poisoned");
        for worker in workers.drain(..) {
            worker.abort();
        }
    }
}

// Delegates so that owners of the typed pipeline do not have to go through
// `handle()` for everyday operations.
impl<I: Clone, O: Clone> Pipeline<I, O> {
    /// See [`PipelineHandle::read`].
    pub fn read<T: Any + Send>(&self, obj: T) {
        self.handle.read(obj);
    }

    /// See [`PipelineHandle::write`].
    pub fn write<T: Any + Send>(&self, obj: T) {
        self.handle.write(obj);
    }

    /// See [`PipelineHandle::current_state`].
    pub fn current_state(&self) -> State {
        self.handle.current_state()
    }

    /// See [`PipelineHandle::state`].
    pub fn state(&self) -> watch::Receiver<State> {
        self.handle.state()
    }

    /// See [`PipelineHandle::events`].
    pub fn events(&self) -> Subscription<PipelineEvent> {
        self.handle.events()
    }

    /// See [`PipelineHandle::stop_now`].
    pub fn stop_now(&self) {
        self.handle.stop_now();
    }

    /// See [`PipelineHandle::clear_queues`].
    pub fn clear_queues(&self) {
        self.handle.clear_queues();
    }
}

async fn worker_loop<T: Any + Clone + Send + 'static>(
    handle: PipelineHandle,
    direction: Direction,
    terminal: Arc<Publisher<T>>,
) {
    loop {
        let obj = match direction {
            Direction::Inbound => handle.inner.read_queue.pop().await,
            Direction::Outbound => handle.inner.write_queue.pop().await,
        };
        let entries = handle.inner.entries.read().await;
        process_object(&handle, &entries, obj, direction, &terminal);
    }
}

/// Threads one object through the whole chain in the given direction and
/// publishes the survivors on the terminal stream.
fn process_object<T: Any + Clone + Send + 'static>(
    handle: &PipelineHandle,
    entries: &[Entry],
    obj: Object,
    direction: Direction,
    terminal: &Publisher<T>,
) {
    let order: Vec<usize> = match direction {
        Direction::Inbound => (0..entries.len()).collect(),
        Direction::Outbound => (0..entries.len()).rev().collect(),
    };

    let mut cache: Vec<Object> = vec![obj];
    for (step, &index) in order.iter().enumerate() {
        let pipe = &entries[index].pipe;
        let mut forwarded = Vec::new();
        for item in cache.drain(..) {
            let mut out = Vec::new();
            let result = match direction {
                Direction::Inbound => pipe.on_reading(handle, item, &mut out),
                Direction::Outbound => pipe.on_writing(handle, item, &mut out),
            };
            match result {
                Ok(()) => forwarded.append(&mut out),
                Err(cause) => {
                    let remaining = order[step + 1..].iter().map(|&index| &entries[index]);
                    propagate_exception(handle, remaining, cause, direction);
                    return;
                }
            }
        }
        if forwarded.is_empty() {
            return;
        }
        cache = forwarded;
    }

    for item in cache {
        match item.downcast::<T>() {
            Ok(value) => terminal.publish(*value),
            Err(_) => {
                log::trace!(
                    "discarding {:?} object of foreign type at the terminal",
                    direction
                );
            }
        }
    }
}

/// Offers the error to each remaining pipe of the direction; the first that
/// swallows it stops the propagation.
fn propagate_exception<'a>(
    handle: &PipelineHandle,
    remaining: impl Iterator<Item = &'a Entry>,
    mut cause: Error,
    direction: Direction,
) {
    for entry in remaining {
        let result = match direction {
            Direction::Inbound => entry.pipe.catch_inbound_exception(handle, cause),
            Direction::Outbound => entry.pipe.catch_outbound_exception(handle, cause),
        };
        match result {
            Ok(()) => return,
            Err(rethrown) => cause = rethrown,
        }
    }
    log::debug!("unhandled {:?} pipeline error: {}", direction, cause);
    handle.inner.events.publish(PipelineEvent::ExceptionCaught {
        direction,
        error: cause,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures::StreamExt;

    /// Tags integers with its label.
    struct TagPipe {
        label: &'static str,
    }

    impl Pipe for TagPipe {
        fn on_reading(
            &self,
            _pipeline: &PipelineHandle,
            obj: Object,
            out: &mut Vec<Object>,
        ) -> Result<(), Error> {
            match obj.downcast::<u32>() {
                Ok(n) => out.push(Box::new((*n, self.label))),
                Err(obj) => out.push(obj),
            }
            Ok(())
        }
    }

    struct DropOddPipe;

    impl Pipe for DropOddPipe {
        fn on_reading(
            &self,
            _pipeline: &PipelineHandle,
            obj: Object,
            out: &mut Vec<Object>,
        ) -> Result<(), Error> {
            match obj.downcast::<u32>() {
                Ok(n) if *n % 2 == 0 => out.push(n),
                Ok(_) => {}
                Err(obj) => out.push(obj),
            }
            Ok(())
        }
    }

    struct FailPipe;

    impl Pipe for FailPipe {
        fn on_reading(
            &self,
            _pipeline: &PipelineHandle,
            _obj: Object,
            _out: &mut Vec<Object>,
        ) -> Result<(), Error> {
            Err(Error::InvalidState)
        }
    }

    struct SwallowPipe;

    impl Pipe for SwallowPipe {
        fn catch_inbound_exception(
            &self,
            _pipeline: &PipelineHandle,
            _cause: Error,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    /// Records the order in which objects pass it while writing.
    struct PushLabelPipe {
        label: &'static str,
    }

    impl Pipe for PushLabelPipe {
        fn on_writing(
            &self,
            _pipeline: &PipelineHandle,
            obj: Object,
            out: &mut Vec<Object>,
        ) -> Result<(), Error> {
            match obj.downcast::<Vec<&'static str>>() {
                Ok(mut labels) => {
                    labels.push(self.label);
                    out.push(labels);
                }
                Err(obj) => out.push(obj),
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn reading_traverses_from_outbound_to_inbound_end() {
        let pipeline: Pipeline<(u32, &'static str), ()> = Pipeline::new();
        pipeline
            .handle()
            .add_at_inbound_end(Some("tag"), Arc::new(TagPipe { label: "first" }))
            .await
            .unwrap()
            .unwrap();
        let mut inbound = pipeline.inbound_stream();
        pipeline.start();

        pipeline.read(7u32);
        assert_eq!(inbound.next().await, Some((7, "first")));
    }

    #[tokio::test]
    async fn writing_traverses_in_reverse_order() {
        let pipeline: Pipeline<(), Vec<&'static str>> = Pipeline::new();
        pipeline
            .handle()
            .add_at_inbound_end(Some("a"), Arc::new(PushLabelPipe { label: "a" }))
            .await
            .unwrap()
            .unwrap();
        pipeline
            .handle()
            .add_at_inbound_end(Some("b"), Arc::new(PushLabelPipe { label: "b" }))
            .await
            .unwrap()
            .unwrap();
        let mut outbound = pipeline.outbound_stream();
        pipeline.start();

        pipeline.write(Vec::<&'static str>::new());
        // Writing starts at the inbound end: "b" first, then "a".
        assert_eq!(outbound.next().await, Some(vec!["b", "a"]));
    }

    #[tokio::test]
    async fn pipes_may_drop_objects() {
        let pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline
            .handle()
            .add_at_inbound_end(Some("filter"), Arc::new(DropOddPipe))
            .await
            .unwrap()
            .unwrap();
        let mut inbound = pipeline.inbound_stream();
        pipeline.start();

        for n in 0..6u32 {
            pipeline.read(n);
        }
        assert_eq!(inbound.next().await, Some(0));
        assert_eq!(inbound.next().await, Some(2));
        assert_eq!(inbound.next().await, Some(4));
    }

    #[tokio::test]
    async fn foreign_terminal_types_are_dropped_silently() {
        let pipeline: Pipeline<u32, ()> = Pipeline::new();
        let mut inbound = pipeline.inbound_stream();
        pipeline.start();

        pipeline.read("not a number");
        pipeline.read(3u32);
        assert_eq!(inbound.next().await, Some(3));
    }

    #[tokio::test]
    async fn unhandled_errors_surface_as_events() {
        let pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline
            .handle()
            .add_at_inbound_end(Some("fail"), Arc::new(FailPipe))
            .await
            .unwrap()
            .unwrap();
        let mut events = pipeline.events();
        pipeline.start();

        pipeline.read(1u32);
        match events.recv().await {
            Some(PipelineEvent::ExceptionCaught {
                direction: Direction::Inbound,
                error: Error::InvalidState,
            }) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn downstream_pipes_may_swallow_errors() {
        let pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline
            .handle()
            .add_at_inbound_end(Some("fail"), Arc::new(FailPipe))
            .await
            .unwrap()
            .unwrap();
        pipeline
            .handle()
            .add_at_inbound_end(Some("swallow"), Arc::new(SwallowPipe))
            .await
            .unwrap()
            .unwrap();
        let mut events = pipeline.events();
        pipeline.start();

        pipeline.read(1u32);
        pipeline.read(2u32);
        // Both errors are swallowed; nothing may reach the event stream.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(pipeline);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn names_are_unique() {
        let pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline
            .handle()
            .add_at_inbound_end(Some("only"), Arc::new(BlankPipe))
            .await
            .unwrap()
            .unwrap();
        let result = pipeline
            .handle()
            .add_at_inbound_end(Some("only"), Arc::new(BlankPipe))
            .await
            .unwrap();
        assert_eq!(result, Err(PipelineError::NameCollision("only".to_owned())));
        // Unnamed pipes do not collide.
        assert!(pipeline
            .handle()
            .add_at_inbound_end(None, Arc::new(BlankPipe))
            .await
            .unwrap()
            .is_ok());
        assert!(pipeline
            .handle()
            .add_at_inbound_end(None, Arc::new(BlankPipe))
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn anchored_insertion_and_removal() {
        let pipeline: Pipeline<u32, ()> = Pipeline::new();
        let handle = pipeline.handle();
        handle
            .add_at_inbound_end(Some("middle"), Arc::new(BlankPipe))
            .await
            .unwrap()
            .unwrap();
        handle
            .add_towards_outbound_end("middle", Some("head"), Arc::new(BlankPipe))
            .await
            .unwrap()
            .unwrap();
        handle
            .add_towards_inbound_end("middle", Some("tail"), Arc::new(BlankPipe))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            handle.names().await,
            vec![
                Some("head".to_owned()),
                Some("middle".to_owned()),
                Some("tail".to_owned())
            ]
        );

        handle.remove("middle").await.unwrap().unwrap();
        assert_eq!(
            handle.names().await,
            vec![Some("head".to_owned()), Some("tail".to_owned())]
        );
        assert_eq!(
            handle.remove("middle").await.unwrap().unwrap_err(),
            PipelineError::NoSuchEntry("middle".to_owned())
        );
    }

    /// Replacing a middle pipe while a thousand objects stream through must
    /// neither lose nor reorder anything, and every object must traverse
    /// either the old or the new pipe, never a half-mutated chain.
    #[tokio::test]
    async fn replacement_under_load_loses_nothing() {
        let pipeline: Pipeline<(u32, &'static str), ()> = Pipeline::new();
        let handle = pipeline.handle().clone();
        handle
            .add_at_outbound_end(Some("front"), Arc::new(BlankPipe))
            .await
            .unwrap()
            .unwrap();
        handle
            .add_at_inbound_end(Some("tagger"), Arc::new(TagPipe { label: "old" }))
            .await
            .unwrap()
            .unwrap();
        handle
            .add_at_inbound_end(Some("back"), Arc::new(BlankPipe))
            .await
            .unwrap()
            .unwrap();
        let mut inbound = pipeline.inbound_stream();
        pipeline.start();

        let feeder = {
            let handle = handle.clone();
            tokio::spawn(async move {
                for n in 0..1000u32 {
                    handle.read(n);
                    if n % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        let replacer = {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                handle
                    .replace("tagger", Arc::new(TagPipe { label: "new" }))
                    .await
                    .unwrap()
                    .unwrap();
            })
        };

        let mut seen_new = false;
        for expected in 0..1000u32 {
            let (n, label) = inbound.next().await.expect("stream ended early");
            assert_eq!(n, expected, "object lost or reordered");
            match label {
                "old" => assert!(!seen_new, "old pipe seen after the new one"),
                _ => seen_new = true,
            }
        }
        feeder.await.unwrap();
        replacer.await.unwrap();
    }

    #[tokio::test]
    async fn stop_now_abandons_queued_work() {
        let pipeline: Pipeline<u32, ()> = Pipeline::new();
        let mut inbound = pipeline.inbound_stream();
        pipeline.start();
        pipeline.read(1u32);
        assert_eq!(inbound.next().await, Some(1));

        pipeline.stop_now();
        assert_eq!(pipeline.current_state(), State::Stopped);
        pipeline.read(2u32);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Restarting picks the queued object back up.
        pipeline.start();
        assert_eq!(inbound.next().await, Some(2));
    }
}
