/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::{Duration, Instant};

use mail_auth::MX;
use serde_json::{json, Value};

use mta::config::Config;
use mta::core::Core;
use mta::outbound::delivery::{Worker, WorkerHandle};
use mta::queue::client::{Error as QueueError, QueueClient};

use crate::mock::{MockBodyStore, MockQueue, MockSmtp, MockWebhook, SmtpBehavior, StartTls};

const BODY: &[u8] = b"hello world\r\n";

fn build_core(queue_addr: &str, api_port: u16, smtp_port: u16, extra: &str) -> Arc<Core> {
    let (queue_host, queue_port) = queue_addr.rsplit_once(':').unwrap();
    let config = format!(
        r#"
        [api]
        hostname = "127.0.0.1"
        port = {api_port}

        [queue]
        hostname = "{queue_host}"
        port = {queue_port}

        {extra}

        [[zone]]
        name = "default"
        port = {smtp_port}
        ip-strategy = "ipv4"
        "#
    );
    let core = Core::new(Config::parse(&config).unwrap()).unwrap();

    let valid_until = Instant::now() + Duration::from_secs(30);
    core.resolver.mx_add(
        "y.test",
        vec![MX {
            exchanges: vec!["mx.y.test".to_string()],
            preference: 10,
        }],
        valid_until,
    );
    core.resolver
        .ipv4_add("mx.y.test", vec!["127.0.0.1".parse().unwrap()], valid_until);
    Arc::new(core)
}

async fn start_worker(
    core: &Arc<Core>,
) -> (
    WorkerHandle,
    tokio::task::JoinHandle<Result<(), QueueError>>,
) {
    let queue = QueueClient::connect(
        &core.queue_addr,
        core.zones[0].name.clone(),
        core.queue_timeout,
        core.timers.clone(),
    )
    .await
    .unwrap();
    let worker = Worker::new(core.clone(), core.zones[0].clone(), queue);
    let handle = worker.handle();
    let task = tokio::spawn(worker.run());
    (handle, task)
}

fn job(id: &str) -> Value {
    json!({
        "id": id,
        "seq": 1,
        "from": "a@x.test",
        "to": ["b@y.test"],
        "domain": "y.test",
        "headers": [
            {"name": "From", "value": "a@x.test"},
            {"name": "To", "value": "b@y.test"},
            {"name": "Subject", "value": "hello"}
        ],
        "bodySize": BODY.len(),
        "deferredCount": 0,
        "messageId": format!("<{id}@x.test>")
    })
}

fn mail_from_lines(smtp: &MockSmtp) -> Vec<String> {
    smtp.transcript()
        .into_iter()
        .filter(|line| line.starts_with("MAIL FROM:"))
        .collect()
}

#[tokio::test]
async fn delivers_and_releases() {
    let smtp = MockSmtp::start(SmtpBehavior::default()).await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let core = build_core(&queue.addr, body_store.port, smtp.port, "");

    queue.push_job(job("m1"), "lock-1");
    let (_handle, _task) = start_worker(&core).await;

    let commands = queue.wait_for_commands(1).await;
    assert_eq!(commands[0]["cmd"], "RELEASE");
    assert_eq!(commands[0]["id"], "m1");
    assert_eq!(commands[0]["seq"], 1);
    assert_eq!(commands[0]["lock"], "lock-1");

    // Exactly one Received header, prepended at index 0 of the wire block.
    let message = smtp.wait_for_message().await;
    let text = String::from_utf8(message.clone()).unwrap();
    assert!(text.starts_with("Received: from queue (default) by "));
    assert_eq!(text.matches("Received:").count(), 1);
    assert!(text.contains("Subject: hello\r\n"));
    assert!(text.ends_with("hello world\r\n"));

    // SIZE is the built header block plus the body, exactly.
    let mail_from = mail_from_lines(&smtp).pop().unwrap();
    let size: usize = mail_from
        .split_once("SIZE=")
        .expect("SIZE advertised")
        .1
        .trim()
        .parse()
        .unwrap();
    assert_eq!(size, message.len());

    // Command latencies land in the registry.
    assert!(core.timers.totals("Command:GET").is_some());
    assert!(core.timers.totals("Command:RELEASE").is_some());
    assert!(core.timers.totals("Delivery:send").is_some());
}

#[tokio::test]
async fn transient_reply_defers_with_exponential_ttl() {
    let smtp = MockSmtp::start(SmtpBehavior {
        data_reply: "451 4.3.0 try later".to_string(),
        ..SmtpBehavior::default()
    })
    .await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let core = build_core(&queue.addr, body_store.port, smtp.port, "");

    queue.push_job(job("m1"), "lock-1");
    let (_handle, _task) = start_worker(&core).await;

    let commands = queue.wait_for_commands(1).await;
    assert_eq!(commands[0]["cmd"], "DEFER");
    assert_eq!(commands[0]["lock"], "lock-1");
    // deferredCount 0 -> 5^1 minutes.
    assert_eq!(commands[0]["ttl"], 5 * 60 * 1000);
}

#[tokio::test]
async fn chronic_deferrals_become_rejects() {
    let smtp = MockSmtp::start(SmtpBehavior {
        data_reply: "451 4.3.0 try later".to_string(),
        ..SmtpBehavior::default()
    })
    .await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let core = build_core(&queue.addr, body_store.port, smtp.port, "");

    let mut chronic = job("m1");
    chronic["deferredCount"] = json!(7);
    queue.push_job(chronic, "lock-1");
    let (_handle, _task) = start_worker(&core).await;

    let commands = queue.wait_for_commands(1).await;
    assert_eq!(commands[0]["cmd"], "RELEASE");
}

#[tokio::test]
async fn permanent_reject_fires_webhook_and_internal_bounce() {
    let smtp = MockSmtp::start(SmtpBehavior {
        data_reply: "550 5.1.1 no such user".to_string(),
        ..SmtpBehavior::default()
    })
    .await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let webhook = MockWebhook::start().await;
    let extra = format!("[bounces]\nurl = \"{}\"\nenabled = true\n", webhook.url);
    let core = build_core(&queue.addr, body_store.port, smtp.port, &extra);

    queue.push_job(job("m1"), "lock-1");
    let (_handle, _task) = start_worker(&core).await;

    let commands = queue.wait_for_commands(2).await;
    assert_eq!(commands[0]["cmd"], "RELEASE");
    assert_eq!(commands[1]["cmd"], "BOUNCE");
    assert_eq!(commands[1]["response"], "550 5.1.1 no such user");
    assert_eq!(commands[1]["returnPath"], "a@x.test");
    let headers = commands[1]["headers"].as_array().unwrap();
    assert_eq!(headers[0]["name"], "Received");

    let payload = webhook.wait_for_payload().await;
    assert_eq!(payload["id"], "m1");
    assert_eq!(payload["category"], "recipient");
    assert_eq!(payload["response"], "550 5.1.1 no such user");
}

#[tokio::test]
async fn starttls_failure_downgrades_and_retries_the_same_address() {
    let smtp = MockSmtp::start(SmtpBehavior {
        starttls: StartTls::Broken,
        ..SmtpBehavior::default()
    })
    .await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let core = build_core(&queue.addr, body_store.port, smtp.port, "");

    assert!(!core.zones[0].starttls_disabled());
    queue.push_job(job("m1"), "lock-1");
    let (_handle, _task) = start_worker(&core).await;

    let commands = queue.wait_for_commands(1).await;
    assert_eq!(commands[0]["cmd"], "RELEASE");

    // The broken upgrade poisoned STARTTLS for the whole zone; the same
    // address was redialed in plaintext.
    assert!(core.zones[0].starttls_disabled());
    assert_eq!(smtp.connections(), 2);
    let transcript = smtp.transcript();
    assert_eq!(
        transcript
            .iter()
            .filter(|line| line.starts_with("STARTTLS"))
            .count(),
        1
    );
}

#[tokio::test]
async fn missing_mx_defers_with_synthetic_reply() {
    let queue = MockQueue::start().await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let core = build_core(&queue.addr, body_store.port, 2525, "");

    let valid_until = Instant::now() + Duration::from_secs(30);
    core.resolver.mx_add("nomx.test", vec![], valid_until);
    core.resolver.ipv4_add("nomx.test", vec![], valid_until);

    let mut unroutable = job("m1");
    unroutable["domain"] = json!("nomx.test");
    unroutable["to"] = json!(["b@nomx.test"]);
    queue.push_job(unroutable, "lock-1");
    let (_handle, _task) = start_worker(&core).await;

    let commands = queue.wait_for_commands(1).await;
    assert_eq!(commands[0]["cmd"], "DEFER");
    assert_eq!(commands[0]["ttl"], 5 * 60 * 1000);
}

#[tokio::test]
async fn received_loop_suppresses_internal_bounce() {
    let smtp = MockSmtp::start(SmtpBehavior {
        data_reply: "550 5.1.1 no such user".to_string(),
        ..SmtpBehavior::default()
    })
    .await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let webhook = MockWebhook::start().await;
    let extra = format!("[bounces]\nurl = \"{}\"\nenabled = true\n", webhook.url);
    let core = build_core(&queue.addr, body_store.port, smtp.port, &extra);

    let mut looping = job("m1");
    let mut headers = looping["headers"].as_array().unwrap().clone();
    for hop in 0..26 {
        headers.push(json!({"name": "Received", "value": format!("hop {hop}")}));
    }
    looping["headers"] = json!(headers);
    queue.push_job(looping, "lock-1");
    let (_handle, _task) = start_worker(&core).await;

    let commands = queue.wait_for_commands(1).await;
    assert_eq!(commands[0]["cmd"], "RELEASE");

    // The webhook still fires; the internal bounce does not.
    webhook.wait_for_payload().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.commands().len(), 1);
}

#[tokio::test]
async fn empty_queue_backs_off_and_recovers() {
    let smtp = MockSmtp::start(SmtpBehavior::default()).await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let core = build_core(&queue.addr, body_store.port, smtp.port, "");

    let (_handle, _task) = start_worker(&core).await;

    // Let the worker poll an empty queue a few times before work arrives.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(queue.commands().is_empty());
    queue.push_job(job("m1"), "lock-1");

    let commands = queue.wait_for_commands(1).await;
    assert_eq!(commands[0]["cmd"], "RELEASE");
    let (_, gets) = core.timers.totals("Command:GET").unwrap();
    assert!(gets > 1, "expected repeated GET polls, saw {gets}");
}

#[tokio::test]
async fn close_drains_the_worker() {
    let smtp = MockSmtp::start(SmtpBehavior::default()).await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let core = build_core(&queue.addr, body_store.port, smtp.port, "");

    queue.push_job(job("m1"), "lock-1");
    let (handle, task) = start_worker(&core).await;
    queue.wait_for_commands(1).await;

    handle.close();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("worker did not drain")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn srs_rewrites_the_envelope_sender_only() {
    let smtp = MockSmtp::start(SmtpBehavior::default()).await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let extra = "[srs]\nenabled = true\nrewrite-domain = \"fwd.test\"\nexclude-domains = [\"keep.test\"]\nsecret = \"s3cret\"\n";
    let core = build_core(&queue.addr, body_store.port, smtp.port, extra);

    queue.push_job(job("m1"), "lock-1");
    let mut excluded = job("m2");
    excluded["from"] = json!("c@keep.test");
    queue.push_job(excluded, "lock-2");
    let (_handle, _task) = start_worker(&core).await;

    queue.wait_for_commands(2).await;
    let mail_from = mail_from_lines(&smtp);
    assert!(
        mail_from[0].starts_with("MAIL FROM:<SRS0=") && mail_from[0].contains("@fwd.test>"),
        "unexpected envelope: {}",
        mail_from[0]
    );
    assert!(mail_from[0].contains("=x.test=a@fwd.test"));
    assert!(mail_from[1].starts_with("MAIL FROM:<c@keep.test>"));

    // The From: header is untouched either way.
    let message = smtp.wait_for_message().await;
    let text = String::from_utf8(message).unwrap();
    assert!(text.contains("From: a@x.test\r\n"));
}

#[tokio::test]
async fn dkim_signature_is_prepended_below_received() {
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    let smtp = MockSmtp::start(SmtpBehavior::default()).await;
    let body_store = MockBodyStore::start(BODY.to_vec()).await;
    let queue = MockQueue::start().await;
    let core = build_core(&queue.addr, body_store.port, smtp.port, "[dkim]\nenabled = true\n");

    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
    let mut signed = job("m1");
    signed["dkim"] = json!([{
        "hashAlgo": "rsa-sha256",
        "bodyHash": "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=",
        "keys": [{"domain": "x.test", "selector": "zone1", "privateKey": pem}]
    }]);
    queue.push_job(signed, "lock-1");
    let (_handle, _task) = start_worker(&core).await;

    queue.wait_for_commands(1).await;
    let message = smtp.wait_for_message().await;
    let text = String::from_utf8(message).unwrap();
    let lines = text.split("\r\n").collect::<Vec<_>>();
    assert!(lines[0].starts_with("Received: "));
    assert!(lines[1].starts_with("DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed; d=x.test; s=zone1;"));
}
