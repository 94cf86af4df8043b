use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::bus::producer::OutputProducer;
use crate::bus::{consumer, CommitAck};
use crate::config::Config;
use crate::derive::Registry;
use crate::dispatch::Dispatcher;
use crate::lookup::Lookup;
use crate::metrics::PipelineMetrics;
use crate::worker::Worker;

/// Process exit code: 0 for a clean shutdown, 1 when a fatal was observed.
pub async fn run(cfg: Config) -> Result<i32> {
    let instance = cfg.instance();

    // Operational metrics registry; the HTTP endpoint is optional.
    let metrics = Arc::new(
        PipelineMetrics::new(&instance, &cfg.misc.metrics_listen)
            .context("creating metrics registry")?,
    );
    if cfg.misc.produce_metrics {
        metrics.start().await.context("starting metrics endpoint")?;
        info!("launched metrics endpoint");
    }

    // Shared tag lookup client.
    let lookup = Arc::new(Lookup::new(&cfg.lookup).context("creating lookup client")?);

    // One worker per processor; each host hashes to exactly one worker.
    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let (death_tx, mut death_rx) = mpsc::channel::<anyhow::Error>(worker_count + 1);
    let (commit_tx, commit_rx) = mpsc::unbounded_channel::<CommitAck>();

    let worker_cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let mut inputs = Vec::with_capacity(worker_count);
    for num in 0..worker_count {
        let (input_tx, input_rx) = mpsc::channel(cfg.hurricane.handler_queue_length);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let producer = OutputProducer::new(&cfg.kafka, &instance, events_tx)
            .with_context(|| format!("creating producer for worker {num}"))?;

        let worker = Worker::new(
            num,
            Registry::from_config(&cfg.hurricane, &lookup),
            Arc::clone(&lookup),
            producer,
            events_rx,
            input_rx,
            death_tx.clone(),
            Arc::clone(&metrics),
            instance.clone(),
            worker_cancel.clone(),
        );

        tracker.spawn(worker.run());
        inputs.push(input_tx);
        info!(worker = num, "launched worker");
    }

    // Consumer with dispatcher and offset committer.
    let kafka_consumer =
        consumer::build(&cfg.kafka, &instance).context("creating consumer")?;

    tracker.spawn(consumer::run_committer(
        Arc::clone(&kafka_consumer),
        commit_rx,
    ));

    let consumer_cancel = CancellationToken::new();
    let consumer_task = {
        let death_tx = death_tx.clone();
        let dispatcher = Dispatcher::new(inputs);
        let topic = cfg.kafka.consumer_topic.clone();
        let cancel = consumer_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = consumer::run(kafka_consumer, dispatcher, commit_tx, topic, cancel).await
            {
                let _ = death_tx.send(e).await;
            }
        })
    };

    // The supervisor keeps no commit or death senders of its own; the
    // committer and the drain loop must observe channel closure.
    drop(death_tx);

    // Main loop: multiplex shutdown signals and fatal errors.
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut fault = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            _ = sigterm.recv() => {
                info!("received shutdown signal");
                break;
            }
            err = death_rx.recv() => {
                match err {
                    Some(err) => {
                        error!(error = %err, "handler died");
                        fault = true;
                    }
                    None => error!("all handlers gone"),
                }
                break;
            }
        }
    }

    // Orderly shutdown: metrics endpoint first, then the consumer (which
    // closes the worker input queues on exit), then the workers.
    metrics.stop();

    consumer_cancel.cancel();
    let _ = consumer_task.await;

    worker_cancel.cancel();

    // Small grace window for residual error reports.
    let grace = tokio::time::sleep(Duration::from_millis(10));
    tokio::pin!(grace);
    loop {
        tokio::select! {
            _ = &mut grace => break,
            err = death_rx.recv() => match err {
                Some(err) => {
                    error!(error = %err, "handler died");
                    fault = true;
                }
                None => break,
            },
        }
    }

    tracker.close();
    tracker.wait().await;

    info!("shutdown complete");
    Ok(if fault { 1 } else { 0 })
}
