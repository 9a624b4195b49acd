//! Event-driven watchdog: one subscription task per watched service.
//!
//! Watching a service records its role nodes in the [`MonitorIndex`], runs
//! one health check through the VM driver and subscribes to each node's
//! event topic. The service's task then turns every classified VM event
//! into a health intent for the node's role. Node set changes are picked up
//! by the task on its next iteration; when the service has no nodes left
//! the task unsubscribes and exits.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowgrid_intent::{IntentSender, Session};
use flowgrid_role::VmDriver;
use flowgrid_state::{NodeId, Service, ServiceId, classify};

use crate::bus::{BusMessage, EventBus, EventSubscriber};
use crate::codec::{decode, topic_for};
use crate::error::WatchdogResult;
use crate::index::MonitorIndex;

/// Default receive timeout; the task re-checks its node set at least this often.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

struct WatchSlot {
    generation: u64,
    handle: JoinHandle<()>,
    /// Wakes the task to reconcile its subscriptions.
    wake: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
}

pub struct Watchdog {
    bus: Arc<dyn EventBus>,
    driver: Arc<dyn VmDriver>,
    intents: IntentSender,
    session: Session,
    monitor: Arc<RwLock<MonitorIndex>>,
    slots: Arc<RwLock<HashMap<ServiceId, WatchSlot>>>,
    generation: AtomicU64,
    recv_timeout: Duration,
}

impl Watchdog {
    pub fn new(
        bus: Arc<dyn EventBus>,
        driver: Arc<dyn VmDriver>,
        intents: IntentSender,
        session: Session,
    ) -> Self {
        Self {
            bus,
            driver,
            intents,
            session,
            monitor: Arc::new(RwLock::new(MonitorIndex::new())),
            slots: Arc::new(RwLock::new(HashMap::new())),
            generation: AtomicU64::new(0),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Start (or restart) watching every node of `service`.
    ///
    /// Returns the number of nodes watched. A service without nodes is not
    /// watched and any task left over for it is stopped.
    pub async fn start_watching(&self, service: &Service) -> WatchdogResult<usize> {
        let service_id = service.id;
        let count = self.monitor.write().await.insert_service(service);
        if count == 0 {
            self.stop_task(service_id).await;
            debug!(service_id, "service has no nodes, nothing to watch");
            return Ok(0);
        }

        self.check_health(service_id).await;

        let nodes = self.monitor.read().await.nodes_of(service_id);
        let subscriber = match self.subscribe_all(&nodes).await {
            Ok(sub) => sub,
            Err(e) => {
                self.monitor.write().await.remove_service(service_id);
                self.stop_task(service_id).await;
                return Err(e);
            }
        };
        self.spawn_task(service_id, subscriber, nodes).await;

        info!(service_id, nodes = count, "watching service");
        Ok(count)
    }

    /// Stop watching a service. Returns false if it was not watched.
    pub async fn stop_watching(&self, service_id: ServiceId) -> bool {
        let was_watched = self.monitor.write().await.remove_service(service_id).is_some();
        self.stop_task(service_id).await;
        if was_watched {
            info!(service_id, "stopped watching service");
        }
        was_watched
    }

    /// Stop watching one node (scale-down, undeploy).
    pub async fn update_node(&self, service_id: ServiceId, role: &str, node_id: NodeId) -> bool {
        let removed = self
            .monitor
            .write()
            .await
            .remove_node(service_id, role, node_id);
        if removed {
            debug!(service_id, %role, node_id, "node no longer watched");
            self.wake(service_id).await;
        }
        removed
    }

    /// Start watching one more node (scale-up). Starts a task for the
    /// service if none is running.
    pub async fn watch_node(
        &self,
        service_id: ServiceId,
        role: &str,
        node_id: NodeId,
    ) -> WatchdogResult<bool> {
        let added = self
            .monitor
            .write()
            .await
            .add_node(service_id, role, node_id);

        let running = self
            .slots
            .read()
            .await
            .get(&service_id)
            .is_some_and(|slot| !slot.handle.is_finished());
        if running {
            self.wake(service_id).await;
        } else {
            match self.bus.subscriber().await {
                Ok(subscriber) => {
                    self.spawn_task(service_id, subscriber, BTreeSet::new()).await;
                }
                Err(e) => {
                    self.monitor
                        .write()
                        .await
                        .remove_node(service_id, role, node_id);
                    return Err(e.into());
                }
            }
        }
        debug!(service_id, %role, node_id, "node watched");
        Ok(added)
    }

    pub async fn is_watching(&self, service_id: ServiceId) -> bool {
        self.monitor.read().await.contains(service_id)
    }

    /// Services with at least one watched node.
    pub async fn watched(&self) -> Vec<ServiceId> {
        self.monitor.read().await.services()
    }

    /// Services whose subscription task is still alive.
    pub async fn active_tasks(&self) -> Vec<ServiceId> {
        let slots = self.slots.read().await;
        let mut ids: Vec<_> = slots
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every task (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        for (service_id, slot) in slots.drain() {
            let _ = slot.stop_tx.send(true);
            debug!(service_id, "watch task stopped");
        }
        *self.monitor.write().await = MonitorIndex::new();
        info!("all watch tasks stopped");
    }

    /// Query the driver once for every watched node of the service and
    /// send an intent for each one that already carries a signal.
    async fn check_health(&self, service_id: ServiceId) {
        let nodes: Vec<(String, NodeId)> = match self.monitor.read().await.roles_of(service_id) {
            Some(roles) => roles
                .iter()
                .flat_map(|(role, ids)| ids.iter().map(move |id| (role.clone(), *id)))
                .collect(),
            None => return,
        };

        for (role, node_id) in nodes {
            let info = match self.driver.info(node_id).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(service_id, %role, node_id, error = %e, "health check could not read vm");
                    continue;
                }
            };
            if let Some(kind) = classify(&info.state, &info.lcm_state) {
                debug!(service_id, %role, node_id, %kind, state = %info.state, lcm_state = %info.lcm_state, "initial health signal");
                if let Err(e) = self
                    .intents
                    .trigger(kind, &self.session, service_id, &role, node_id)
                    .await
                {
                    warn!(service_id, %role, node_id, error = %e, "health intent not sent");
                }
            }
        }
    }

    async fn subscribe_all(
        &self,
        nodes: &BTreeSet<NodeId>,
    ) -> WatchdogResult<Box<dyn EventSubscriber>> {
        let mut subscriber = self.bus.subscriber().await?;
        for node_id in nodes {
            subscriber.subscribe(&topic_for(*node_id)).await?;
        }
        Ok(subscriber)
    }

    async fn spawn_task(
        &self,
        service_id: ServiceId,
        subscriber: Box<dyn EventSubscriber>,
        subscribed: BTreeSet<NodeId>,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let wake = Arc::new(Notify::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = WatchTask {
            service_id,
            generation,
            bus: Arc::clone(&self.bus),
            monitor: Arc::clone(&self.monitor),
            slots: Arc::clone(&self.slots),
            intents: self.intents.clone(),
            session: self.session.clone(),
            recv_timeout: self.recv_timeout,
        };

        // Hold the lock across spawn so the task cannot deregister a slot
        // that has not been inserted yet.
        let mut slots = self.slots.write().await;
        let handle = tokio::spawn(task.run(subscriber, subscribed, Arc::clone(&wake), stop_rx));
        if let Some(old) = slots.insert(
            service_id,
            WatchSlot {
                generation,
                handle,
                wake,
                stop_tx,
            },
        ) {
            let _ = old.stop_tx.send(true);
        }
    }

    async fn stop_task(&self, service_id: ServiceId) {
        if let Some(slot) = self.slots.write().await.remove(&service_id) {
            let _ = slot.stop_tx.send(true);
        }
    }

    async fn wake(&self, service_id: ServiceId) {
        if let Some(slot) = self.slots.read().await.get(&service_id) {
            slot.wake.notify_one();
        }
    }
}

/// Everything one service's subscription task needs.
struct WatchTask {
    service_id: ServiceId,
    generation: u64,
    bus: Arc<dyn EventBus>,
    monitor: Arc<RwLock<MonitorIndex>>,
    slots: Arc<RwLock<HashMap<ServiceId, WatchSlot>>>,
    intents: IntentSender,
    session: Session,
    recv_timeout: Duration,
}

impl WatchTask {
    async fn run(
        self,
        mut subscriber: Box<dyn EventSubscriber>,
        mut subscribed: BTreeSet<NodeId>,
        wake: Arc<Notify>,
        mut stop: watch::Receiver<bool>,
    ) {
        let service_id = self.service_id;
        debug!(service_id, "watch task starting");

        loop {
            if *stop.borrow() {
                break;
            }
            let wanted = self.monitor.read().await.nodes_of(service_id);
            if wanted.is_empty() {
                debug!(service_id, "no nodes left to watch");
                break;
            }
            self.reconcile(subscriber.as_mut(), &mut subscribed, &wanted)
                .await;

            let received = tokio::select! {
                r = subscriber.recv(self.recv_timeout) => Some(r),
                _ = wake.notified() => None,
                _ = stop.changed() => break,
            };

            match received {
                Some(Ok(Some(msg))) => self.handle(msg).await,
                Some(Ok(None)) | None => {}
                Some(Err(e)) => {
                    error!(service_id, error = %e, "event bus receive failed, reconnecting");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    match self.bus.subscriber().await {
                        Ok(fresh) => {
                            subscriber = fresh;
                            subscribed.clear();
                        }
                        Err(e) => warn!(service_id, error = %e, "event bus reconnect failed"),
                    }
                }
            }
        }

        for node_id in std::mem::take(&mut subscribed) {
            if let Err(e) = subscriber.unsubscribe(&topic_for(node_id)).await {
                debug!(service_id, node_id, error = %e, "unsubscribe failed");
            }
        }

        let mut slots = self.slots.write().await;
        if slots
            .get(&service_id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            slots.remove(&service_id);
        }
        debug!(service_id, "watch task stopped");
    }

    /// Bring the subscription set in line with the watched nodes.
    async fn reconcile(
        &self,
        subscriber: &mut dyn EventSubscriber,
        subscribed: &mut BTreeSet<NodeId>,
        wanted: &BTreeSet<NodeId>,
    ) {
        let stale: Vec<NodeId> = subscribed.difference(wanted).copied().collect();
        for node_id in stale {
            match subscriber.unsubscribe(&topic_for(node_id)).await {
                Ok(()) => {
                    subscribed.remove(&node_id);
                }
                Err(e) => {
                    warn!(service_id = self.service_id, node_id, error = %e, "unsubscribe failed")
                }
            }
        }
        let fresh: Vec<NodeId> = wanted.difference(subscribed).copied().collect();
        for node_id in fresh {
            match subscriber.subscribe(&topic_for(node_id)).await {
                Ok(()) => {
                    subscribed.insert(node_id);
                }
                Err(e) => {
                    warn!(service_id = self.service_id, node_id, error = %e, "subscribe failed")
                }
            }
        }
    }

    async fn handle(&self, msg: BusMessage) {
        let service_id = self.service_id;
        let event = match decode(&msg.topic, &msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(service_id, topic = %msg.topic, error = %e, "ignoring malformed vm event");
                return;
            }
        };

        let Some(role) = self.monitor.read().await.role_of(service_id, event.node_id) else {
            debug!(service_id, node_id = event.node_id, "event for unwatched node");
            return;
        };
        let Some(kind) = classify(&event.state, &event.lcm_state) else {
            return;
        };

        info!(
            service_id,
            %role,
            node_id = event.node_id,
            %kind,
            state = %event.state,
            lcm_state = %event.lcm_state,
            "vm health event"
        );
        if let Err(e) = self
            .intents
            .trigger(kind, &self.session, service_id, &role, event.node_id)
            .await
        {
            warn!(service_id, %role, node_id = event.node_id, error = %e, "health intent not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, ZmqBus};
    use crate::error::WatchdogError;
    use flowgrid_intent::{Intent, intent_channel};
    use flowgrid_role::{MemoryDriver, VmInfo};
    use flowgrid_state::{HealthEvent, LcmState, Node, Role, VmState};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    fn vm(id: NodeId, state: VmState, lcm_state: LcmState) -> VmInfo {
        VmInfo {
            id,
            uid: 0,
            gid: 0,
            uname: "flowgrid".to_string(),
            gname: "flowgrid".to_string(),
            name: format!("vm-{id}"),
            state,
            lcm_state,
            sched_action_ids: Vec::new(),
        }
    }

    fn service(id: ServiceId, role: &str, nodes: &[NodeId]) -> Service {
        let mut r = Role::new(role, 0, nodes.len() as u32);
        r.nodes = nodes.iter().map(|n| Node::new(*n, None)).collect();
        Service::new(id, "shop", vec![r])
    }

    async fn setup(
        nodes: &[(NodeId, VmState, LcmState)],
    ) -> (Watchdog, MemoryBus, mpsc::Receiver<Intent>) {
        let driver = Arc::new(MemoryDriver::new());
        for (id, state, lcm) in nodes {
            driver.insert_vm(vm(*id, state.clone(), lcm.clone())).await;
        }
        let bus = MemoryBus::new(64);
        let (sender, rx) = intent_channel(64);
        let watchdog = Watchdog::new(
            Arc::new(bus.clone()),
            driver,
            sender,
            Session::new("flowgrid", "t"),
        )
        .with_recv_timeout(Duration::from_millis(50));
        (watchdog, bus, rx)
    }

    fn pending(id: NodeId) -> (NodeId, VmState, LcmState) {
        (id, VmState::Pending, LcmState::LcmInit)
    }

    fn trigger_of(intent: Intent) -> (HealthEvent, ServiceId, String, NodeId) {
        match intent {
            Intent::Trigger {
                kind,
                service_id,
                role,
                node_id,
                ..
            } => (kind, service_id, role, node_id),
            other => panic!("unexpected intent {other:?}"),
        }
    }

    async fn next_trigger(rx: &mut mpsc::Receiver<Intent>) -> (HealthEvent, ServiceId, String, NodeId) {
        let intent = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        trigger_of(intent)
    }

    /// Publish until an intent shows up; the task subscribes asynchronously.
    async fn publish_until_intent(
        bus: &MemoryBus,
        rx: &mut mpsc::Receiver<Intent>,
        topic: &str,
        payload: &str,
    ) -> (HealthEvent, ServiceId, String, NodeId) {
        for _ in 0..100 {
            bus.publish(topic, payload);
            if let Ok(Some(intent)) = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await
            {
                return trigger_of(intent);
            }
        }
        panic!("no intent for {topic}");
    }

    #[tokio::test]
    async fn running_event_yields_one_intent() {
        let (watchdog, bus, mut rx) = setup(&[pending(5), pending(7)]).await;
        assert_eq!(watchdog.start_watching(&service(1, "worker", &[5, 7])).await.unwrap(), 2);
        assert!(rx.try_recv().is_err());

        bus.publish("EVENT VM 7", "garbage");
        bus.publish("EVENT VM 7", "7/RUNNING/RUNNING");

        assert_eq!(
            next_trigger(&mut rx).await,
            (HealthEvent::Running, 1, "worker".to_string(), 7)
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(watchdog.is_watching(1).await);
        assert_eq!(watchdog.active_tasks().await, vec![1]);
    }

    #[tokio::test]
    async fn event_for_unmonitored_node_yields_nothing() {
        let (watchdog, bus, mut rx) = setup(&[pending(5), pending(7)]).await;
        watchdog.start_watching(&service(1, "worker", &[5, 7])).await.unwrap();

        bus.publish("EVENT VM 99", "99/POWEROFF/LCM_INIT");
        bus.publish("EVENT VM 99/POWEROFF/LCM_INIT", "");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // The task is still alive and reacts to monitored nodes.
        bus.publish("EVENT VM 5", "5/ACTIVE/RUNNING");
        assert_eq!(
            next_trigger(&mut rx).await,
            (HealthEvent::Running, 1, "worker".to_string(), 5)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_without_a_signal_are_dropped() {
        let (watchdog, bus, mut rx) = setup(&[pending(5)]).await;
        watchdog.start_watching(&service(1, "worker", &[5])).await.unwrap();

        bus.publish("EVENT VM 5", "5/ACTIVE/PROLOG");
        bus.publish("EVENT VM 5", "5/DONE/LCM_INIT");
        assert_eq!(
            next_trigger(&mut rx).await,
            (HealthEvent::Done, 1, "worker".to_string(), 5)
        );
    }

    #[tokio::test]
    async fn initial_check_reports_existing_failures() {
        let (watchdog, _bus, mut rx) = setup(&[
            (5, VmState::Poweroff, LcmState::LcmInit),
            pending(7),
        ])
        .await;
        watchdog.start_watching(&service(1, "worker", &[5, 7])).await.unwrap();

        assert_eq!(
            trigger_of(rx.try_recv().unwrap()),
            (HealthEvent::Error, 1, "worker".to_string(), 5)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_node_is_ignored() {
        let (watchdog, bus, mut rx) = setup(&[pending(5), pending(7)]).await;
        watchdog.start_watching(&service(1, "worker", &[5, 7])).await.unwrap();

        assert!(watchdog.update_node(1, "worker", 5).await);
        assert!(!watchdog.update_node(1, "worker", 5).await);

        bus.publish("EVENT VM 5", "5/POWEROFF/LCM_INIT");
        bus.publish("EVENT VM 7", "7/POWEROFF/LCM_INIT");
        assert_eq!(
            next_trigger(&mut rx).await,
            (HealthEvent::Error, 1, "worker".to_string(), 7)
        );
    }

    #[tokio::test]
    async fn task_exits_when_last_node_is_removed() {
        let (watchdog, _bus, _rx) = setup(&[pending(5)]).await;
        watchdog.start_watching(&service(1, "worker", &[5])).await.unwrap();

        watchdog.update_node(1, "worker", 5).await;
        assert!(!watchdog.is_watching(1).await);

        for _ in 0..100 {
            if watchdog.active_tasks().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("watch task did not exit");
    }

    #[tokio::test]
    async fn watch_node_extends_running_task() {
        let (watchdog, bus, mut rx) = setup(&[pending(5), pending(7)]).await;
        watchdog.start_watching(&service(1, "worker", &[5, 7])).await.unwrap();

        assert!(watchdog.watch_node(1, "worker", 8).await.unwrap());
        assert_eq!(
            publish_until_intent(&bus, &mut rx, "EVENT VM 8", "8/ACTIVE/RUNNING").await,
            (HealthEvent::Running, 1, "worker".to_string(), 8)
        );
    }

    #[tokio::test]
    async fn watch_node_starts_task_for_unwatched_service() {
        let (watchdog, bus, mut rx) = setup(&[]).await;
        watchdog.watch_node(2, "db", 3).await.unwrap();
        assert_eq!(watchdog.watched().await, vec![2]);
        assert_eq!(
            publish_until_intent(&bus, &mut rx, "EVENT VM 3", "3/ACTIVE/RUNNING").await,
            (HealthEvent::Running, 2, "db".to_string(), 3)
        );
    }

    #[tokio::test]
    async fn stop_watching_silences_service() {
        let (watchdog, bus, mut rx) = setup(&[pending(5)]).await;
        watchdog.start_watching(&service(1, "worker", &[5])).await.unwrap();

        assert!(watchdog.stop_watching(1).await);
        assert!(!watchdog.stop_watching(1).await);
        assert!(watchdog.watched().await.is_empty());

        bus.publish("EVENT VM 5", "5/POWEROFF/LCM_INIT");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn restart_replaces_node_set() {
        let (watchdog, bus, mut rx) = setup(&[pending(5), pending(9)]).await;
        watchdog.start_watching(&service(1, "worker", &[5])).await.unwrap();
        watchdog.start_watching(&service(1, "worker", &[9])).await.unwrap();

        bus.publish("EVENT VM 5", "5/POWEROFF/LCM_INIT");
        bus.publish("EVENT VM 9", "9/POWEROFF/LCM_INIT");
        assert_eq!(
            next_trigger(&mut rx).await,
            (HealthEvent::Error, 1, "worker".to_string(), 9)
        );
    }

    #[tokio::test]
    async fn service_without_nodes_is_not_watched() {
        let (watchdog, _bus, _rx) = setup(&[]).await;
        assert_eq!(watchdog.start_watching(&service(1, "worker", &[])).await.unwrap(), 0);
        assert!(!watchdog.is_watching(1).await);
        assert!(watchdog.active_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_bus_fails_start() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let driver = Arc::new(MemoryDriver::new());
        driver.insert_vm(vm(5, VmState::Pending, LcmState::LcmInit)).await;
        let (sender, _rx) = intent_channel(8);
        let watchdog = Watchdog::new(
            Arc::new(
                ZmqBus::new(&format!("tcp://{addr}"))
                    .unwrap()
                    .with_connect_timeout(Duration::from_millis(200)),
            ),
            driver,
            sender,
            Session::new("flowgrid", "t"),
        );

        let err = watchdog
            .start_watching(&service(1, "worker", &[5]))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchdogError::Bus(_)));
        assert!(!watchdog.is_watching(1).await);
    }
}
