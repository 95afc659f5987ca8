use crate::config::ControllerSettings;
use crate::filter::NamespaceFilter;
use crate::reconciler::{Outcome, ReconcileError};
use crate::registry::RegistryClient;
use crate::state::{ControllerContext, Readiness};
use crate::store::ObjectStore;
use crate::workload::{PodTemplated, WorkloadKey};
use anyhow::Context;
use futures::{Stream, StreamExt, TryStreamExt, future, stream};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::api::ListParams;
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::{self, Store, store::Writer};
use kube::runtime::{Controller, WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let api_server_info = client
        .apiserver_version()
        .await
        .context("Failed to reach the Kubernetes API server")?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Fails when the service account may not list `K` across all namespaces.
pub async fn ensure_watchable<K: PodTemplated>(client: &Client) -> anyhow::Result<()> {
    let api: Api<K> = Api::all(client.clone());
    api.list(&ListParams::default().limit(1))
        .await
        .with_context(|| format!("Cannot list {} objects, check the RBAC permissions", K::KIND))?;
    Ok(())
}

pub async fn reconcile<K, S, R>(
    object: Arc<K>,
    ctx: Arc<ControllerContext<S, R>>,
) -> Result<Action, ReconcileError>
where
    K: PodTemplated,
    S: ObjectStore,
    R: RegistryClient,
{
    let key = WorkloadKey::for_object(object.as_ref());
    if !ctx.reconciler.config().namespaces.admit(&key.namespace) {
        debug!("Ignoring {}, its namespace is excluded", key);
        return Ok(Action::await_change());
    }
    debug!("Reconciling {}", key);

    match ctx.reconciler.reconcile(&key, &ctx.scope).await? {
        Outcome::Skipped => debug!("Skipped {}, it was deleted before processing", key),
        Outcome::UpToDate => debug!("{} already uses mirrored images", key),
        Outcome::Updated => info!("Successfully mirrored all images of {}", key),
    }
    Ok(Action::await_change())
}

/// Logs the failure. Nothing is requeued: the next change event or resync retries.
pub fn error_policy<K, S, R>(
    object: Arc<K>,
    error: &ReconcileError,
    _ctx: Arc<ControllerContext<S, R>>,
) -> Action
where
    K: PodTemplated,
{
    if error.is_conflict() {
        warn!("{}", error_chain(error));
    } else {
        let key = WorkloadKey::for_object(object.as_ref());
        error!("Reconcile of {} failed: {}", key, error_chain(error));
    }
    Action::await_change()
}

fn error_chain(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Runs one controller per workload kind until a shutdown signal arrives.
///
/// `readiness` turns true once both kinds have completed their initial list.
pub async fn run<S, R>(
    client: Client,
    ctx: Arc<ControllerContext<S, R>>,
    settings: &ControllerSettings,
    readiness: Readiness,
) -> anyhow::Result<()>
where
    S: ObjectStore + 'static,
    R: RegistryClient + 'static,
{
    let (deployment_resync, daemon_set_resync, mut scheduler) = match &settings.resync_schedule {
        Some(schedule) => {
            let (deployment_tx, deployment_rx) = mpsc::channel(1);
            let (daemon_set_tx, daemon_set_rx) = mpsc::channel(1);
            let scheduler = schedule_resync(schedule, vec![deployment_tx, daemon_set_tx]).await?;
            (Some(deployment_rx), Some(daemon_set_rx), Some(scheduler))
        }
        None => (None, None, None),
    };

    let filter = &ctx.reconciler.config().namespaces;
    let (deployments, deployment_writer) = reflector::store();
    let (daemon_sets, daemon_set_writer) = reflector::store();
    let deployment_controller = controller_for::<Deployment, _>(
        watch_events(&client),
        deployments.clone(),
        deployment_writer,
        filter.clone(),
        settings.concurrency,
        deployment_resync,
    );
    let daemon_set_controller = controller_for::<DaemonSet, _>(
        watch_events(&client),
        daemon_sets.clone(),
        daemon_set_writer,
        filter.clone(),
        settings.concurrency,
        daemon_set_resync,
    );

    future::join3(
        drive(deployment_controller, ctx.clone()),
        drive(daemon_set_controller, ctx.clone()),
        mark_ready_once_synced(readiness, deployments, daemon_sets),
    )
    .await;

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.shutdown().await?;
    }
    Ok(())
}

async fn mark_ready_once_synced(
    readiness: Readiness,
    deployments: Store<Deployment>,
    daemon_sets: Store<DaemonSet>,
) {
    if deployments.wait_until_ready().await.is_ok() && daemon_sets.wait_until_ready().await.is_ok()
    {
        info!("Initial list of all workloads complete");
        readiness.set_ready(true);
    }
}

fn watch_events<K: PodTemplated>(
    client: &Client,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static {
    watcher(Api::all(client.clone()), watcher::Config::default()).default_backoff()
}

/// Whether `event` may reach the reflector store. Objects in ignored namespaces never
/// enter the store, so neither change events nor a resync can enqueue them.
fn admits<K: PodTemplated>(filter: &NamespaceFilter, event: &watcher::Event<K>) -> bool {
    match event {
        watcher::Event::Apply(object)
        | watcher::Event::InitApply(object)
        | watcher::Event::Delete(object) => filter.admit(&object.namespace().unwrap_or_default()),
        watcher::Event::Init | watcher::Event::InitDone => true,
    }
}

fn controller_for<K, E>(
    events: E,
    reader: Store<K>,
    writer: Writer<K>,
    filter: NamespaceFilter,
    concurrency: u16,
    resync: Option<mpsc::Receiver<()>>,
) -> Controller<K>
where
    K: PodTemplated,
    E: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    let objects = events
        .try_filter(move |event| future::ready(admits(&filter, event)))
        .reflect(writer)
        .applied_objects();

    let mut controller = Controller::for_stream(objects, reader)
        .with_config(controller::Config::default().concurrency(concurrency));
    if let Some(resync) = resync {
        controller = controller.reconcile_all_on(stream::unfold(resync, |mut rx| async move {
            rx.recv().await.map(|tick| (tick, rx))
        }));
    }
    controller
}

async fn drive<K, S, R>(controller: Controller<K>, ctx: Arc<ControllerContext<S, R>>)
where
    K: PodTemplated,
    S: ObjectStore + 'static,
    R: RegistryClient + 'static,
{
    info!("Watching {} objects in all namespaces", K::KIND);
    controller
        .shutdown_on_signal()
        .run(reconcile::<K, S, R>, error_policy::<K, S, R>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object),
                // already logged by error_policy
                Err(controller::Error::ReconcilerFailed(_, _)) => {}
                Err(e) => warn!("{} controller error: {}", K::KIND, error_chain(&e)),
            }
        })
        .await;
    info!("Stopped watching {} objects", K::KIND);
}

async fn schedule_resync(
    schedule: &str,
    senders: Vec<mpsc::Sender<()>>,
) -> anyhow::Result<JobScheduler> {
    info!("Executing periodic resync at cron schedule {}", schedule);
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(schedule.to_owned(), move |_uuid, _l| {
        let senders = senders.clone();
        Box::pin(async move {
            info!("Triggering resync of all watched workloads");
            for sender in &senders {
                if sender.try_send(()).is_err() {
                    debug!("Resync is already pending");
                }
            }
        })
    })
    .with_context(|| format!("Invalid resync schedule {}", schedule))?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}
