use std::{sync::Arc, time::Duration};

use gateway_flags::{
    CallerContext, CreateExperimentRequest, CreateFlagRequest, InMemoryConfigStore, PolicyConfig,
    RoutingPolicy, ServiceConfig, Variant,
};

pub fn main() -> gateway_flags::Result<()> {
    // Configure env_logger to see flag evaluation logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("gateway_flags=debug"))
        .init();

    let environment =
        std::env::var("GATEWAY_ENVIRONMENT").unwrap_or_else(|_| "development".to_owned());
    let store = Arc::new(InMemoryConfigStore::new());
    let service = Arc::new(
        ServiceConfig::new()
            .with_environment(environment)
            .with_refresh_interval(Duration::from_secs(5))
            .to_service(store),
    );

    service.create_flag(CreateFlagRequest::new("intelligent-routing"))?;
    service.create_flag(CreateFlagRequest {
        rollout_percentage: 50.0,
        ..CreateFlagRequest::new("cost-optimization")
    })?;
    service.create_flag(CreateFlagRequest::new("provider-anthropic-enabled"))?;
    service.create_flag(CreateFlagRequest::new("provider-openai-enabled"))?;
    service.create_experiment(CreateExperimentRequest::new(
        "batching-experiment",
        vec![
            Variant::new("large-batches", 50.0),
            Variant::new("small-batches", 50.0),
        ],
    ))?;

    // Keep the caches converging with the store in the background.
    let refresher = service.start_refresh_thread()?;
    if let Err(err) = refresher.wait_for_first_refresh() {
        println!("error loading definitions: {:?}", err);
    }

    let policy = RoutingPolicy::new(Arc::clone(&service), PolicyConfig::new());
    for user in ["alice", "bob", "carol"] {
        let context = CallerContext::new(user).with_attribute("tier", "pro");
        println!("{user}: {:?}", policy.resolve(&context));
    }
    println!("Statistics: {:?}", service.get_statistics());

    refresher.shutdown()
}
