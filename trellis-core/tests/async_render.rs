//! Asynchronous Render Tests
//!
//! A slow render must never overwrite a newer state: if the sink is
//! invalidated while its job is in flight, the job's result is dropped.

use std::time::Duration;

use tokio::sync::oneshot;
use trellis_core::{CellSpec, GraphConfig, NodeState, ReactiveError, Session, Trigger};

#[tokio::test]
async fn completed_render_is_committed() {
    let session = Session::default();
    let (bins, hist) = {
        let graph = session.lock();
        let bins = graph.define_cell(CellSpec::new("bins", 20_i64)).unwrap();
        let hist = graph
            .define_sink("hist", [bins.id()], move |g| Ok(format!("{} bins", g.get(&bins)?)))
            .unwrap();
        (bins, hist)
    };

    let artifact = session
        .render_async(&hist, |g| g.get(&bins), |bins| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(format!("{bins} bins"))
        })
        .await
        .unwrap();

    assert_eq!(artifact.as_deref(), Some("20 bins"));
    assert_eq!(session.lock().state(hist.id()).unwrap(), NodeState::Clean);
    // The committed artifact is served without running the sync render.
    assert_eq!(session.render(&hist).unwrap(), "20 bins");
    assert_eq!(session.lock().evaluations(hist.id()).unwrap(), 1);
}

#[tokio::test]
async fn render_invalidated_in_flight_is_discarded() {
    let session = Session::default();
    let (bins, hist) = {
        let graph = session.lock();
        let bins = graph.define_cell(CellSpec::new("bins", 20_i64)).unwrap();
        let hist = graph
            .define_sink("hist", [bins.id()], move |g| Ok(format!("{} bins", g.get(&bins)?)))
            .unwrap();
        (bins, hist)
    };

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let worker = session.clone();
    let in_flight = tokio::spawn(async move {
        worker
            .render_async(&hist, move |g| g.get(&bins), move |bins| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(format!("{bins} bins"))
            })
            .await
    });

    // The job holds no lock, so a newer batch can land meanwhile.
    started_rx.await.unwrap();
    session.batch(|g| g.set(&bins, 30)).unwrap();
    release_tx.send(()).unwrap();

    let outcome = in_flight.await.unwrap().unwrap();
    assert_eq!(outcome, None);
    assert!(session.lock().artifact(&hist).is_none());
    assert_eq!(session.lock().state(hist.id()).unwrap(), NodeState::Dirty);

    assert_eq!(session.render(&hist).unwrap(), "30 bins");
}

#[tokio::test]
async fn failed_job_is_cached_on_the_sink() {
    let session = Session::default();
    let (bins, hist) = {
        let graph = session.lock();
        let bins = graph.define_cell(CellSpec::new("bins", 0_i64)).unwrap();
        let hist = graph
            .define_sink("hist", [bins.id()], move |g| Ok(g.get(&bins)?.to_string()))
            .unwrap();
        (bins, hist)
    };

    let err = session
        .render_async(&hist, |g| g.get(&bins), |bins| async move {
            Err::<String, _>(ReactiveError::failed(format!("cannot plot {bins} bins")))
        })
        .await
        .unwrap_err();

    assert_eq!(err.origin(), Some("hist"));
    assert_eq!(session.lock().state(hist.id()).unwrap(), NodeState::Errored);
    assert!(session.lock().artifact(&hist).unwrap().is_err());
}

#[tokio::test]
async fn push_emissions_reach_async_subscribers() {
    let session = Session::new(GraphConfig {
        default_trigger: Trigger::Push,
        ..Default::default()
    })
    .unwrap();
    let mut emissions = session.subscribe();

    let bins = {
        let graph = session.lock();
        let bins = graph.define_cell(CellSpec::new("bins", 20_i64)).unwrap();
        graph
            .define_sink("hist", [bins.id()], move |g| g.get(&bins))
            .unwrap();
        bins
    };
    let first = emissions.recv().await.unwrap();

    let writer = session.clone();
    tokio::spawn(async move {
        writer.batch(|g| g.set(&bins, 25)).unwrap();
    })
    .await
    .unwrap();

    let second = emissions.recv().await.unwrap();
    assert_eq!(second.sink, "hist");
    assert!(second.ok);
    assert!(second.epoch > first.epoch);
}
