// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs one transaction through the harvest core and prints the payloads as JSON lines.
//!
//! ```sh
//! HARVEST_LOG=debug cargo run -p libdd-harvest --example harvest-cycle
//! ```

use libdd_harvest::aggregator::{CustomEvents, LogEntry, LogEvents, TransactionEvents};
use libdd_harvest::harvester::SendStatus;
use libdd_harvest::normalizer::TxSegmentNormalizer;
use libdd_harvest::transaction::{TransactionEventRecorder, TransactionKind};
use libdd_harvest::transport::{FileTransport, Transport};
use libdd_harvest::{
    log, AgentConfig, AttributeFilter, Destinations, EventAggregator, Harvester, Transaction,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AgentConfig::from_env();
    config.run_id.get_or_insert_with(|| String::from("demo-run"));
    config.transaction_segment_terms = json!([
        {"prefix": "WebTransaction/Uri/users", "terms": ["profile"]}
    ]);
    log::init(config.logging.level)?;

    let transport: Arc<dyn Transport> =
        Arc::new(FileTransport::from_writer(Box::new(std::io::stdout())));
    let transactions = EventAggregator::new(TransactionEvents, &config, transport.clone());
    let custom = EventAggregator::new(CustomEvents, &config, transport.clone());
    let logs = EventAggregator::new(LogEvents::default(), &config, transport);

    let mut harvester = Harvester::new();
    harvester.add(Arc::new(transactions.clone()));
    harvester.add(Arc::new(custom.clone()));
    harvester.add(Arc::new(logs.clone()));
    harvester.start();

    let mut normalizer = TxSegmentNormalizer::new();
    normalizer.load(&config.transaction_segment_terms);
    let filter = Arc::new(AttributeFilter::new(&config));

    let mut tx = Transaction::new(TransactionKind::Web, filter)
        .with_normalizer(Arc::new(normalizer));
    tx.add_listener(Arc::new(TransactionEventRecorder::new(transactions)));
    tx.set_url("/users/1234/profile?tab=settings");
    tx.set_status_code(200);
    tx.add_attribute(Destinations::TRANS_COMMON, "user.plan", "pro");
    tx.add_attribute(Destinations::TRANS_COMMON, "request.headers.cookie", "session=1");

    if let Some(root) = tx.push_tracer("Middleware/router") {
        if let Some(query) = tx.push_tracer("Datastore/statement/users/select") {
            tokio::time::sleep(std::time::Duration::from_millis(15)).await;
            tx.finish_tracer(query);
        }
        tx.finish_tracer(root);
    }

    custom.add(json!({"type": "ProfileViewed", "plan": "pro"}));
    let name = tx.final_name().unwrap_or_default().to_owned();
    logs.add(LogEntry::lazy(move || {
        Ok(json!({"message": "profile rendered", "transaction.name": name}))
    }));

    let report = harvester.clear().await;
    for outcome in &report.outcomes {
        match &outcome.status {
            SendStatus::Sent => eprintln!("{}: sent", outcome.method),
            SendStatus::Disabled => eprintln!("{}: disabled", outcome.method),
            SendStatus::Failed(e) => eprintln!("{}: failed: {e}", outcome.method),
        }
    }
    harvester.stop();
    Ok(())
}
