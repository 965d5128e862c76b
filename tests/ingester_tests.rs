//! End-to-end tests over the ingester write path:
//! - Push/query roundtrips, single and multi tenant
//! - Duplicate and out-of-order sample handling
//! - Per-tenant and per-metric admission limits
//! - Flush handoff to the chunk store, including failure retry
//! - Lifecycle and cancellation behavior

use headwater::prelude::*;

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn labels(pairs: &[(&str, &str)]) -> Labels {
    Labels::from_pairs(pairs.iter().copied())
}

fn new_ingester(config: IngesterConfig) -> (Arc<MemoryChunkStore>, Ingester) {
    init_tracing();
    let store = Arc::new(MemoryChunkStore::new());
    let ingester = Ingester::new(config, store.clone());
    (store, ingester)
}

/// A config whose background thresholds never fire during a test.
fn quiet_config() -> IngesterConfig {
    IngesterConfig {
        flush_interval: std::time::Duration::from_secs(3600),
        max_chunk_age: std::time::Duration::from_secs(3600),
        max_series_idle: std::time::Duration::from_secs(3600),
        ..IngesterConfig::default()
    }
}

async fn push_one(
    ingester: &Ingester,
    ctx: &RequestContext,
    labels: Labels,
    t: i64,
    v: f64,
) -> Result<()> {
    ingester
        .push(ctx, WriteRequest::from_samples([(labels, Sample::new(t, v))]))
        .await
}

async fn query_sorted(
    ingester: &Ingester,
    ctx: &RequestContext,
    req: QueryRequest,
) -> Vec<TimeSeries> {
    let mut res = ingester.query(ctx, req).await.unwrap();
    res.sort_by_key(|ts| ts.labels.to_string());
    res
}

fn eq_matcher(name: &str, value: &str) -> LabelMatcher {
    LabelMatcher::new(MatcherType::Eq, name, value)
}

// =========================================================================
// Roundtrip
// =========================================================================

#[tokio::test]
async fn test_basic_roundtrip() {
    let (_store, ingester) = new_ingester(quiet_config());
    let ctx = RequestContext::with_tenant("1");
    let series = labels(&[("__name__", "m"), ("job", "j")]);

    for (t, v) in [(1, 1.0), (2, 2.0), (3, 3.0)] {
        push_one(&ingester, &ctx, series.clone(), t, v).await.unwrap();
    }

    let res = query_sorted(
        &ingester,
        &ctx,
        QueryRequest {
            start_ms: 0,
            end_ms: 10,
            matchers: vec![eq_matcher("__name__", "m")],
        },
    )
    .await;

    assert_eq!(res.len(), 1);
    assert_eq!(res[0].labels, series);
    assert_eq!(
        res[0].samples,
        vec![
            Sample::new(1, 1.0),
            Sample::new(2, 2.0),
            Sample::new(3, 3.0)
        ]
    );
}

#[tokio::test]
async fn test_multi_tenant_append_and_shutdown_handoff() {
    let (store, ingester) = new_ingester(quiet_config());
    let tenants = ["1", "2", "3"];

    // Per tenant: several series, a few hundred samples each, offset so the
    // tenants' data differs.
    let mut expected: HashMap<&str, HashMap<String, Vec<Sample>>> = HashMap::new();
    for (offset, tenant) in tenants.iter().enumerate() {
        let ctx = RequestContext::with_tenant(*tenant);
        for series_idx in 0..5 {
            let name = format!("testmetric_{series_idx}");
            let series = labels(&[("__name__", name.as_str()), ("job", "testjob")]);
            let mut samples = Vec::new();
            for j in 0..200i64 {
                let t = series_idx as i64 + j + offset as i64;
                samples.push(Sample::new(t, t as f64));
            }
            ingester
                .push(
                    &ctx,
                    WriteRequest {
                        timeseries: vec![TimeSeries {
                            labels: series.clone(),
                            samples: samples.clone(),
                        }],
                    },
                )
                .await
                .unwrap();
            expected
                .entry(*tenant)
                .or_default()
                .insert(series.to_string(), samples);
        }
    }

    // Read back through ingester queries.
    for tenant in tenants {
        let ctx = RequestContext::with_tenant(tenant);
        let res = query_sorted(
            &ingester,
            &ctx,
            QueryRequest {
                start_ms: 0,
                end_ms: i64::MAX,
                matchers: vec![LabelMatcher::new(MatcherType::Re, "job", ".+")],
            },
        )
        .await;
        assert_eq!(res.len(), 5);
        for ts in res {
            assert_eq!(&ts.samples, &expected[tenant][&ts.labels.to_string()]);
        }
    }

    // Read back through the chunk store after shutdown.
    ingester.shutdown().await;
    assert_eq!(ingester.lifecycle(), Lifecycle::Stopped);
    for tenant in tenants {
        let flushed = store.samples_for(tenant).unwrap();
        assert_eq!(flushed.len(), 5);
        for (series_labels, samples) in flushed {
            assert_eq!(&samples, &expected[tenant][&series_labels.to_string()]);
        }
    }
}

// =========================================================================
// Duplicate and out-of-order samples
// =========================================================================

#[tokio::test]
async fn test_append_out_of_order_and_duplicate() {
    let (_store, ingester) = new_ingester(quiet_config());
    let ctx = RequestContext::with_tenant("1");
    let series = labels(&[("__name__", "testmetric")]);

    push_one(&ingester, &ctx, series.clone(), 1, 0.0).await.unwrap();

    // Exactly the same sample again: noop.
    push_one(&ingester, &ctx, series.clone(), 1, 0.0).await.unwrap();

    // Earlier sample than the previous one.
    let err = push_one(&ingester, &ctx, series.clone(), 0, 0.0)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("sample timestamp out of order"));
    assert_eq!(err.status_code(), 400);

    // Same timestamp, different value.
    let err = push_one(&ingester, &ctx, series.clone(), 1, 1.0)
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("sample with repeated timestamp but different value"));
    assert_eq!(err.status_code(), 400);

    // Only the first sample survived.
    let res = query_sorted(
        &ingester,
        &ctx,
        QueryRequest {
            start_ms: 0,
            end_ms: 10,
            matchers: vec![eq_matcher("__name__", "testmetric")],
        },
    )
    .await;
    assert_eq!(res.len(), 1);
    assert_eq!(res[0].samples, vec![Sample::new(1, 0.0)]);
}

#[tokio::test]
async fn test_bad_samples_do_not_abort_siblings() {
    let (_store, ingester) = new_ingester(quiet_config());
    let ctx = RequestContext::with_tenant("1");
    let series = labels(&[("__name__", "m")]);

    push_one(&ingester, &ctx, series.clone(), 5, 5.0).await.unwrap();

    // Batch mixing one out-of-order sample with good ones: the error is
    // reported but the good samples land.
    let err = ingester
        .push(
            &ctx,
            WriteRequest {
                timeseries: vec![TimeSeries {
                    labels: series.clone(),
                    samples: vec![
                        Sample::new(3, 3.0),
                        Sample::new(6, 6.0),
                        Sample::new(7, 7.0),
                    ],
                }],
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let res = query_sorted(
        &ingester,
        &ctx,
        QueryRequest {
            start_ms: 0,
            end_ms: 10,
            matchers: vec![eq_matcher("__name__", "m")],
        },
    )
    .await;
    assert_eq!(
        res[0].samples,
        vec![Sample::new(5, 5.0), Sample::new(6, 6.0), Sample::new(7, 7.0)]
    );
}

// =========================================================================
// Admission limits
// =========================================================================

async fn exercise_series_limit(limits: TenantLimits) -> Error {
    let (_store, ingester) = new_ingester(IngesterConfig {
        limits,
        ..quiet_config()
    });
    let ctx = RequestContext::with_tenant("1");
    let first = labels(&[("__name__", "testmetric"), ("foo", "bar")]);
    let second = labels(&[("__name__", "testmetric"), ("foo", "biz")]);

    // One series is fine.
    push_one(&ingester, &ctx, first.clone(), 0, 1.0).await.unwrap();

    // A batch touching the existing series and a new one: the existing
    // series takes its sample before the new series fails admission.
    let err = ingester
        .push(
            &ctx,
            WriteRequest::from_samples([
                (first.clone(), Sample::new(1, 2.0)),
                (second, Sample::new(1, 3.0)),
            ]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 429);

    let res = query_sorted(
        &ingester,
        &ctx,
        QueryRequest {
            start_ms: 0,
            end_ms: 10,
            matchers: vec![eq_matcher("__name__", "testmetric")],
        },
    )
    .await;
    assert_eq!(res.len(), 1);
    assert_eq!(res[0].labels, first);
    assert_eq!(res[0].samples, vec![Sample::new(0, 1.0), Sample::new(1, 2.0)]);

    err
}

#[tokio::test]
async fn test_user_series_limit_exceeded() {
    let err = exercise_series_limit(TenantLimits {
        max_series_per_tenant: 1,
        max_series_per_metric: 0,
    })
    .await;
    assert!(matches!(err, Error::TooManySeriesPerTenant { limit: 1 }));
}

#[tokio::test]
async fn test_metric_series_limit_exceeded() {
    let err = exercise_series_limit(TenantLimits {
        max_series_per_tenant: 0,
        max_series_per_metric: 1,
    })
    .await;
    assert!(matches!(err, Error::TooManySeriesPerMetric { limit: 1, .. }));
}

// =========================================================================
// Tenant isolation
// =========================================================================

#[tokio::test]
async fn test_tenant_isolation() {
    let (_store, ingester) = new_ingester(quiet_config());
    let series = labels(&[("__name__", "m")]);

    let ctx1 = RequestContext::with_tenant("1");
    let ctx2 = RequestContext::with_tenant("2");
    push_one(&ingester, &ctx1, series.clone(), 1, 1.0).await.unwrap();
    push_one(&ingester, &ctx2, series.clone(), 1, 2.0).await.unwrap();

    let req = || QueryRequest {
        start_ms: 0,
        end_ms: 10,
        matchers: vec![eq_matcher("__name__", "m")],
    };
    let res1 = query_sorted(&ingester, &ctx1, req()).await;
    assert_eq!(res1[0].samples, vec![Sample::new(1, 1.0)]);
    let res2 = query_sorted(&ingester, &ctx2, req()).await;
    assert_eq!(res2[0].samples, vec![Sample::new(1, 2.0)]);

    let stats1 = ingester.user_stats(&ctx1).await.unwrap();
    assert_eq!(stats1.series_count, 1);
}

// =========================================================================
// Query boundaries
// =========================================================================

#[tokio::test]
async fn test_query_outside_resident_range_is_empty() {
    let (_store, ingester) = new_ingester(quiet_config());
    let ctx = RequestContext::with_tenant("1");
    let series = labels(&[("__name__", "m")]);
    for t in [100, 200, 300] {
        push_one(&ingester, &ctx, series.clone(), t, t as f64)
            .await
            .unwrap();
    }

    let query = |start_ms, end_ms| QueryRequest {
        start_ms,
        end_ms,
        matchers: vec![eq_matcher("__name__", "m")],
    };

    // Entirely before the first chunk.
    assert!(ingester.query(&ctx, query(0, 99)).await.unwrap().is_empty());
    // Entirely after the last sample.
    assert!(ingester.query(&ctx, query(301, 999)).await.unwrap().is_empty());
    // A single-point window returns exactly the sample at that time.
    let res = ingester.query(&ctx, query(200, 200)).await.unwrap();
    assert_eq!(res[0].samples, vec![Sample::new(200, 200.0)]);
}

#[tokio::test]
async fn test_label_values() {
    let (_store, ingester) = new_ingester(quiet_config());
    let ctx = RequestContext::with_tenant("1");
    for job in ["alpha", "beta"] {
        push_one(
            &ingester,
            &ctx,
            labels(&[("__name__", "m"), ("job", job)]),
            1,
            1.0,
        )
        .await
        .unwrap();
    }
    assert_eq!(
        ingester.label_values(&ctx, "job").await.unwrap(),
        vec!["alpha", "beta"]
    );
    assert!(ingester.label_values(&ctx, "nope").await.unwrap().is_empty());
}

// =========================================================================
// Flush handoff
// =========================================================================

#[tokio::test]
async fn test_flush_handoff_with_chunk_splits() {
    let config = IngesterConfig {
        chunk_capacity: 256,
        ..quiet_config()
    };
    let (store, ingester) = new_ingester(config);
    let ctx = RequestContext::with_tenant("1");
    let series = labels(&[("__name__", "m"), ("job", "j")]);

    let samples: Vec<Sample> = (0..1000).map(|i| Sample::new(i, i as f64)).collect();
    ingester
        .push(
            &ctx,
            WriteRequest {
                timeseries: vec![TimeSeries {
                    labels: series.clone(),
                    samples: samples.clone(),
                }],
            },
        )
        .await
        .unwrap();

    let stats = ingester.user_stats(&ctx).await.unwrap();
    assert_eq!(stats.series_count, 1);
    assert_eq!(stats.chunk_count, 4);

    ingester.shutdown().await;

    // The store holds every sample in push order, split across chunks.
    let flushed = store.samples_for("1").unwrap();
    assert_eq!(flushed, vec![(series, samples)]);
    assert_eq!(store.chunk_count(), 4);
    for chunk in store.chunks_for("1") {
        assert!(chunk.first_time_ms <= chunk.last_time_ms);
    }

    // In-memory state is drained.
    let stats = ingester.user_stats(&ctx).await.unwrap();
    assert_eq!(stats.series_count, 0);
    assert_eq!(stats.chunk_count, 0);
}

#[tokio::test]
async fn test_flush_failure_is_retried() {
    let config = IngesterConfig {
        chunk_capacity: 2,
        ..quiet_config()
    };
    let (store, ingester) = new_ingester(config);
    let ctx = RequestContext::with_tenant("1");
    let series = labels(&[("__name__", "m")]);
    for t in 1..=5 {
        push_one(&ingester, &ctx, series.clone(), t, t as f64)
            .await
            .unwrap();
    }

    // Two sealed chunks pending; the first put fails and leaves them.
    store.fail_next_put();
    ingester.flush().await;
    assert_eq!(store.chunk_count(), 0);
    assert_eq!(ingester.user_stats(&ctx).await.unwrap().chunk_count, 3);

    // The next pass retries successfully.
    ingester.flush().await;
    assert_eq!(store.chunk_count(), 2);
    let flushed = store.samples_for("1").unwrap();
    assert_eq!(
        flushed[0].1,
        (1..=4).map(|t| Sample::new(t, t as f64)).collect::<Vec<_>>()
    );

    // The head stays writable and queryable after the partial flush.
    push_one(&ingester, &ctx, series.clone(), 6, 6.0).await.unwrap();
    let res = query_sorted(
        &ingester,
        &ctx,
        QueryRequest {
            start_ms: 5,
            end_ms: 10,
            matchers: vec![eq_matcher("__name__", "m")],
        },
    )
    .await;
    assert_eq!(res[0].samples, vec![Sample::new(5, 5.0), Sample::new(6, 6.0)]);
}

#[tokio::test]
async fn test_failed_shutdown_flush_keeps_series_resident() {
    let (store, ingester) = new_ingester(quiet_config());
    let ctx = RequestContext::with_tenant("1");
    push_one(&ingester, &ctx, labels(&[("__name__", "m")]), 1, 1.0)
        .await
        .unwrap();

    store.fail_next_put();
    ingester.shutdown().await;

    // Nothing reached the store and the series was not torn down.
    assert_eq!(store.chunk_count(), 0);
    assert_eq!(ingester.user_stats(&ctx).await.unwrap().series_count, 1);
}

// =========================================================================
// Lifecycle and cancellation
// =========================================================================

#[tokio::test]
async fn test_push_requires_tenant() {
    let (_store, ingester) = new_ingester(quiet_config());
    let err = push_one(
        &ingester,
        &RequestContext::anonymous(),
        labels(&[("__name__", "m")]),
        1,
        1.0,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::MissingTenant));
    assert_eq!(err.status_code(), 401);
}

#[tokio::test]
async fn test_push_rejected_after_shutdown() {
    let (_store, ingester) = new_ingester(quiet_config());
    ingester.shutdown().await;

    let ctx = RequestContext::with_tenant("1");
    let err = push_one(&ingester, &ctx, labels(&[("__name__", "m")]), 1, 1.0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotRunning));
    assert_eq!(err.status_code(), 503);
    assert!(matches!(
        ingester
            .query(
                &ctx,
                QueryRequest {
                    start_ms: 0,
                    end_ms: 1,
                    matchers: vec![]
                }
            )
            .await,
        Err(Error::NotRunning)
    ));
}

#[tokio::test]
async fn test_cancelled_push_aborts_mid_batch() {
    let (_store, ingester) = new_ingester(quiet_config());
    let token = CancellationToken::new();
    token.cancel();
    let ctx = RequestContext::with_tenant("1").with_cancellation(token);

    let err = push_one(&ingester, &ctx, labels(&[("__name__", "m")]), 1, 1.0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn test_invalid_labels_are_reported_not_fatal() {
    let (_store, ingester) = new_ingester(quiet_config());
    let ctx = RequestContext::with_tenant("1");
    let good = labels(&[("__name__", "m")]);

    let err = ingester
        .push(
            &ctx,
            WriteRequest::from_samples([
                (labels(&[("", "v")]), Sample::new(1, 1.0)),
                (good.clone(), Sample::new(1, 1.0)),
            ]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidLabels(_)));

    // The valid sibling series landed.
    let res = query_sorted(
        &ingester,
        &ctx,
        QueryRequest {
            start_ms: 0,
            end_ms: 10,
            matchers: vec![eq_matcher("__name__", "m")],
        },
    )
    .await;
    assert_eq!(res.len(), 1);
    assert_eq!(res[0].samples, vec![Sample::new(1, 1.0)]);
}

// =========================================================================
// Concurrency
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pushes_keep_series_count_exact() {
    let (_store, ingester) = new_ingester(quiet_config());
    let ingester = Arc::new(ingester);

    let mut handles = Vec::new();
    for task in 0..8 {
        let ingester = Arc::clone(&ingester);
        handles.push(tokio::spawn(async move {
            let ctx = RequestContext::with_tenant("1");
            let task_label = task.to_string();
            for i in 0..50 {
                let instance_label = i.to_string();
                let series = labels(&[
                    ("__name__", "m"),
                    ("task", task_label.as_str()),
                    ("instance", instance_label.as_str()),
                ]);
                for t in 1..=3 {
                    push_one(&ingester, &ctx, series.clone(), t, t as f64)
                        .await
                        .unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let ctx = RequestContext::with_tenant("1");
    let stats = ingester.user_stats(&ctx).await.unwrap();
    assert_eq!(stats.series_count, 8 * 50);

    let res = ingester
        .query(
            &ctx,
            QueryRequest {
                start_ms: 0,
                end_ms: 10,
                matchers: vec![eq_matcher("__name__", "m")],
            },
        )
        .await
        .unwrap();
    assert_eq!(res.len(), 8 * 50);
    for ts in &res {
        assert_eq!(ts.samples.len(), 3);
    }
}

#[tokio::test]
async fn test_flush_loop_exits_on_shutdown() {
    let config = IngesterConfig {
        flush_interval: std::time::Duration::from_millis(10),
        ..quiet_config()
    };
    let (_store, ingester) = new_ingester(config);
    let ingester = Arc::new(ingester);

    let loop_handle = tokio::spawn({
        let ingester = Arc::clone(&ingester);
        async move { ingester.run_flush_loop().await }
    });

    let ctx = RequestContext::with_tenant("1");
    push_one(&ingester, &ctx, labels(&[("__name__", "m")]), 1, 1.0)
        .await
        .unwrap();

    ingester.shutdown().await;
    tokio::time::timeout(std::time::Duration::from_secs(5), loop_handle)
        .await
        .expect("flush loop must exit after shutdown")
        .unwrap();
}
