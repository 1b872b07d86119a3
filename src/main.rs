#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::Parser;
use kube::api::{Api, ListParams};
use security_policy_sync::{
    index,
    k8s::{self, ResourceExt},
    realize::Backoff,
    tags::IdScheme,
    Config, DryRunClient, Hierarchy, SecurityPolicyService,
};
use std::collections::BTreeSet;

#[derive(Parser)]
#[clap(name = "security-policy-sync", version)]
struct Args {
    /// The tracing filter used for logs
    #[clap(long, env = "SECURITY_POLICY_SYNC_LOG", default_value = "info")]
    log_level: kubert::LogFilter,

    /// The logging format
    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The cluster name tagged on every generated object
    #[clap(long, env = "SECURITY_POLICY_SYNC_CLUSTER")]
    cluster: String,

    /// The domain policies are created in when no VPC is set
    #[clap(long, default_value = "default")]
    domain: String,

    /// Create policies in a VPC, e.g. `/orgs/default/projects/p1/vpcs/v1`
    #[clap(long)]
    vpc_path: Option<String>,

    /// The longest delay between realization polls
    #[clap(long, default_value = "30s")]
    realize_backoff_cap: humantime::Duration,

    /// Print the contents of the policy stores when done
    #[clap(long)]
    dump_store: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        cluster,
        domain,
        vpc_path,
        realize_backoff_cap,
        dump_store,
    } = Args::parse();

    let hierarchy = match vpc_path {
        Some(path) => Hierarchy::from_vpc_path(&path)?,
        None => Hierarchy::Domain(domain),
    };

    let rt = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;
    let client = rt.client();

    tracing::info!(%cluster, %hierarchy, "compiling policies (dry run)");
    let service = SecurityPolicyService::new(
        DryRunClient::default(),
        client.clone(),
        Config { cluster, hierarchy },
    )
    .with_backoff(Backoff {
        cap: realize_backoff_cap.into(),
        ..Backoff::default()
    });
    service.initialize().await?;

    let mut failed = 0;
    let security_policies = Api::<k8s::SecurityPolicy>::all(client.clone())
        .list(&ListParams::default())
        .await?;
    for policy in &security_policies.items {
        if let Err(error) = service.create_or_update_security_policy(policy).await {
            tracing::warn!(
                namespace = ?policy.namespace(),
                name = ?policy.metadata.name,
                reason = error.reason(),
                %error,
                "failed to sync SecurityPolicy"
            );
            failed += 1;
        }
    }

    let network_policies = Api::<k8s::NetworkPolicy>::all(client)
        .list(&ListParams::default())
        .await?;
    for policy in &network_policies.items {
        if let Err(error) = service.create_or_update_network_policy(policy).await {
            tracing::warn!(
                namespace = ?policy.namespace(),
                name = ?policy.metadata.name,
                reason = error.reason(),
                %error,
                "failed to sync NetworkPolicy"
            );
            failed += 1;
        }
    }

    let live = security_policies
        .items
        .iter()
        .filter_map(|p| p.uid())
        .collect::<BTreeSet<_>>();
    service
        .collect_garbage(IdScheme::SecurityPolicy, &live)
        .await?;
    let live = network_policies
        .items
        .iter()
        .filter_map(|p| p.uid())
        .collect::<BTreeSet<_>>();
    service
        .collect_garbage(IdScheme::NetworkPolicy, &live)
        .await?;

    if dump_store {
        println!("{}", index::dump(service.stores()));
    }
    if failed > 0 {
        bail!("{failed} policies could not be synced");
    }
    Ok(())
}
