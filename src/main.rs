use std::path::{Path, PathBuf};
use std::sync::Arc;

use aks_dns_ingress::{
    azure::Authentication,
    controller::{Controller, CONTROLLER_NAME},
    dns,
    kubernetes::{self, Change, KubeEventRecorder, KubeServiceClient},
    reconciler::{Cluster, Reconciler},
    Options,
};
use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::{core::v1::Service, networking::v1::Ingress};
use kube::config::{KubeConfigOptions, Kubeconfig};
use log::{info, warn, LevelFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    init_logging(options.debug);
    options.validate()?;

    let auth = Authentication::load(options.azure_config.as_deref())?;
    auth.validate()?;
    let domain_suffix = options.domain_suffix(&auth.subscription_id);

    let dns_client = Arc::new(dns::Client::new(&auth).context("creating dns client")?);
    check_zone(dns_client.as_ref(), &options.resource_group, &domain_suffix).await;

    let client = kube_client(options.kubeconfig.as_deref()).await?;
    let namespace = options.namespace.as_deref();
    let (services, service_events) = kubernetes::reflect(kubernetes::api::<Service>(&client, namespace));
    let (ingresses, ingress_events) = kubernetes::reflect(kubernetes::api::<Ingress>(&client, namespace));

    let reconciler = Reconciler::new(
        dns_client,
        Cluster {
            services: Arc::new(services.clone()),
            ingresses: Arc::new(ingresses.clone()),
            service_client: Arc::new(KubeServiceClient::new(client.clone())),
            recorder: Arc::new(KubeEventRecorder::new(client, CONTROLLER_NAME)),
        },
        &options.resource_group,
        &domain_suffix,
    );
    let controller = Arc::new(Controller::new(reconciler));

    let observer = Arc::clone(&controller);
    tokio::spawn(kubernetes::forward(service_events, move |change: Change<Service>| {
        observer.observe(change)
    }));
    let observer = Arc::clone(&controller);
    tokio::spawn(kubernetes::forward(ingress_events, move |change: Change<Ingress>| {
        observer.observe(change)
    }));

    info!("waiting for caches to sync");
    kubernetes::wait_for_sync(&services).await?;
    kubernetes::wait_for_sync(&ingresses).await?;

    let observer = Arc::clone(&controller);
    tokio::spawn(kubernetes::resync(services, options.interval, move |service| {
        observer.observe(Change::Applied(service))
    }));
    let observer = Arc::clone(&controller);
    tokio::spawn(kubernetes::resync(ingresses, options.interval, move |ingress| {
        observer.observe(Change::Applied(ingress))
    }));

    info!(
        "publishing LoadBalancer services to zone {domain_suffix} in resource group {}",
        options.resource_group
    );
    let workers = tokio::spawn(controller.run(options.workers));

    let signal = shutdown_signal().await.context("listening for shutdown signals")?;
    info!("received {signal}, gracefully shutting down");
    controller.shutdown().await;
    workers.await?;

    Ok(())
}

fn init_logging(debug: bool) {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

/// Uses the kubeconfig when it exists, in-cluster configuration otherwise.
async fn kube_client(kubeconfig: Option<&Path>) -> anyhow::Result<kube::Client> {
    let path = kubeconfig.map(Path::to_path_buf).or_else(|| {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube").join("config"))
    });

    let config = match path.filter(|path| path.exists()) {
        Some(path) => {
            info!("using kubeconfig {}", path.display());
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => {
            info!("no kubeconfig found, using in-cluster configuration");
            kube::Config::incluster().context("loading in-cluster configuration")?
        }
    };

    Ok(kube::Client::try_from(config)?)
}

/// The zone is managed out of band; a missing one is reported but does not
/// stop the controller.
async fn check_zone(dns: &dyn dns::Interface, resource_group: &str, zone: &str) {
    match dns.get_zone(resource_group, zone).await {
        Ok(lookup) if lookup.is_not_found() => warn!(
            "dns zone {zone} does not exist in resource group {resource_group} ({}), record sets cannot be created until it does",
            lookup.status
        ),
        Ok(_) => info!("found dns zone {zone} in resource group {resource_group}"),
        Err(error) => warn!("looking up dns zone {zone} failed: {error}"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}
