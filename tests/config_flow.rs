//! Configuration pipeline: layered resolve, versioned commit, and a crawl
//! run parameterized by the committed spec.

use anyhow::Result;
use std::collections::BTreeMap;
use std::time::Duration;
use trawler::config::{resolve, ApplyOptions, ConfigLayer, ConfigStore, EngineConfigSpec};
use trawler::CrawlerBuilder;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn spec(raw: &str) -> EngineConfigSpec {
    EngineConfigSpec::from_json(raw).unwrap()
}

#[tokio::test]
async fn resolved_and_committed_config_drives_a_run() -> Result<()> {
    let mut layers = BTreeMap::new();
    layers.insert(
        ConfigLayer::Global,
        spec(r#"{ "global": { "max_concurrency": 4, "timeout": "10s" },
                  "crawling": { "link_rules": { "max_depth": 6 } } }"#),
    );
    layers.insert(
        ConfigLayer::Site,
        spec(r#"{ "crawling": { "link_rules": { "max_depth": 1 },
                                "rate_rules": { "default_delay": "0ms" } } }"#),
    );

    let resolved = resolve(&layers);

    // Commit the resolved spec so the run is traceable to a version.
    let store = ConfigStore::new();
    let committed = store.apply(resolved.clone(), ApplyOptions::actor("ops"))?;
    assert_eq!(committed.version, 1);

    let head = store.head().expect("committed head");
    assert_eq!(
        head.spec.global.as_ref().unwrap().timeout,
        Some(Duration::from_secs(10))
    );

    // The site layer's depth override wins over the global layer.
    let server = MockServer::start().await;
    for (route, body) in [
        ("/", r#"<a href="/a">a</a>"#),
        ("/a", r#"<a href="/b">b</a>"#),
        ("/b", "end"),
    ] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html"))
            .mount(&server)
            .await;
    }

    let crawler = CrawlerBuilder::new()
        .with_start_url(format!("{}/", server.uri()))
        .with_allowed_domains(vec!["127.0.0.1"])
        .with_robots(false)
        .with_max_retries(0)
        .with_engine_spec(&head.spec)
        .build()?;

    let mut results = crawler.start().await?;
    let mut paths = Vec::new();
    while let Some(result) = results.recv().await {
        if result.success {
            paths.push(result.url.path().to_string());
        }
    }
    paths.sort();

    // max_depth = 1 cuts the chain after /a.
    assert_eq!(paths, vec!["/", "/a"]);

    Ok(())
}

#[tokio::test]
async fn rollback_restores_an_earlier_run_parameterization() -> Result<()> {
    let store = ConfigStore::new();

    store.apply(
        spec(r#"{ "global": { "max_concurrency": 1 } }"#),
        ApplyOptions::actor("ops"),
    )?;
    store.apply(
        spec(r#"{ "global": { "max_concurrency": 2 } }"#),
        ApplyOptions::actor("ops"),
    )?;

    let outcome = store.rollback(1, "ops")?;
    assert_eq!(outcome.version, 3);

    let head = store.head().expect("head after rollback");
    assert_eq!(head.spec, store.version(1).expect("v1").spec);
    assert_eq!(
        head.spec.global.as_ref().unwrap().max_concurrency,
        Some(1)
    );

    Ok(())
}
