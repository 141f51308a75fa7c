use carelink_core::{
    wire::WireMsg, Action, AppointmentStatus, NewAppointment, Principal, Role,
};
use carelink_hub::{serve, AppointmentStore, HubConfig, HubState, TokenEntry, TokenTable};
use carelink_sync::{
    AppointmentProjection, ChannelFault, ClientConfig, CoordinationClient, PushChannel,
    StaticToken, SyncError,
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use url::Url;

const WAIT: Duration = Duration::from_secs(15);

struct RunningHub {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<io::Result<()>>,
}

impl RunningHub {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

fn tokens() -> TokenTable {
    let entry = |token: &str, user_id: &str, role| TokenEntry {
        token: token.to_string(),
        principal: Principal {
            user_id: user_id.to_string(),
            role,
            display_name: None,
        },
    };
    TokenTable::from_entries([
        entry("tok-pat", "pat-1", Role::Patient),
        entry("tok-doc", "doc-1", Role::Doctor),
    ])
}

async fn start_hub(addr: SocketAddr, store: Arc<AppointmentStore>) -> RunningHub {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let hub = Arc::new(HubState::new(
        HubConfig::default(),
        tokens(),
        store,
        shutdown_rx,
    ));
    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let task = tokio::spawn(serve(listener, hub));
    RunningHub {
        addr,
        shutdown,
        task,
    }
}

fn client(addr: SocketAddr, token: &str, role: Role) -> CoordinationClient {
    let url = Url::parse(&format!("http://{addr}")).expect("url");
    let config = ClientConfig::new(url, role).expect("config");
    CoordinationClient::new(config, Arc::new(StaticToken::new(token)))
}

async fn wait_connected(channel: &PushChannel, seq: u64) -> bool {
    let mut status = channel.watch_status();
    tokio::time::timeout(WAIT, async move {
        status
            .wait_for(|status| status.is_connected() && status.connection_seq >= seq)
            .await
            .is_ok()
    })
    .await
    .unwrap_or(false)
}

async fn wait_projection<F>(client: &CoordinationClient, predicate: F) -> bool
where
    F: Fn(&AppointmentProjection) -> bool,
{
    let mut projection = client.watch_projection();
    tokio::time::timeout(WAIT, async move {
        projection.wait_for(|value| predicate(value)).await.is_ok()
    })
    .await
    .unwrap_or(false)
}

async fn create_over_http(addr: SocketAddr, reason: &str) -> String {
    let created: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/api/appointments"))
        .bearer_auth("tok-pat")
        .json(&serde_json::json!({ "doctor_ref": "doc-1", "reason": reason }))
        .send()
        .await
        .expect("create")
        .json()
        .await
        .expect("body");
    created["id"].as_str().expect("id").to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn doctor_accept_shows_up_in_the_patient_projection() {
    let hub = start_hub("127.0.0.1:0".parse().expect("addr"), Arc::new(AppointmentStore::new())).await;

    let patient = client(hub.addr, "tok-pat", Role::Patient);
    let channel = patient.start().await.expect("patient start");
    assert!(wait_connected(&channel, 1).await);

    let doctor = client(hub.addr, "tok-doc", Role::Doctor);
    let doctor_channel = doctor.start().await.expect("doctor start");
    assert!(wait_connected(&doctor_channel, 1).await);

    let created = patient
        .create(NewAppointment {
            doctor_ref: "doc-1".to_string(),
            date: None,
            time: None,
            reason: "knee pain".to_string(),
        })
        .await
        .expect("create");
    assert!(wait_projection(&doctor, |p| p.get(&created.id).is_some()).await);

    let accepted = doctor
        .change_status(&created.id, Action::Accept, Some("see you soon".to_string()))
        .await
        .expect("accept");
    assert_eq!(accepted.status, AppointmentStatus::Accepted);

    assert!(
        wait_projection(&patient, |p| {
            p.get(&created.id)
                .is_some_and(|a| a.status == AppointmentStatus::Accepted && a.notes == "see you soon")
        })
        .await
    );

    // Patients cannot accept; the hub answers 403 and nothing changes.
    let err = patient
        .change_status(&created.id, Action::Complete, None)
        .await
        .expect_err("patient cannot complete");
    assert!(matches!(err, SyncError::Api { status: 403, .. }));

    patient.shutdown();
    doctor.shutdown();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hub_restart_reconnects_and_reattaches_once() {
    let store = Arc::new(AppointmentStore::new());
    let hub = start_hub("127.0.0.1:0".parse().expect("addr"), store.clone()).await;
    let addr = hub.addr;

    let patient = client(addr, "tok-pat", Role::Patient);
    let channel = patient.start().await.expect("start");
    assert!(wait_connected(&channel, 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(patient.appointment_events().stats().attach_count, 1);

    hub.stop().await;
    let mut status = channel.watch_status();
    let dropped = tokio::time::timeout(WAIT, async move {
        status.wait_for(|status| !status.is_connected()).await.is_ok()
    })
    .await
    .unwrap_or(false);
    assert!(dropped);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let hub = start_hub(addr, store).await;
    assert!(wait_connected(&channel, 2).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = patient.appointment_events().stats();
    assert_eq!(stats.attach_count, 2);
    assert_eq!(stats.reset_count, 1);
    assert!(stats.attached);

    let id = create_over_http(addr, "after restart").await;
    assert!(wait_projection(&patient, |p| p.get(&id).is_some()).await);

    patient.shutdown();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_attach_on_a_live_connection_means_one_refetch_per_event() {
    let hub = start_hub("127.0.0.1:0".parse().expect("addr"), Arc::new(AppointmentStore::new())).await;
    let patient = client(hub.addr, "tok-pat", Role::Patient);
    let channel = patient.start().await.expect("start");
    assert!(wait_connected(&channel, 1).await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    for _ in 0..5 {
        assert!(!patient.appointment_events().attach(channel.as_ref()));
    }
    let same = patient.start().await.expect("start again");
    assert!(Arc::ptr_eq(&channel, &same));

    let before = patient.dispatcher().refetch_count();
    let id = create_over_http(hub.addr, "single refetch").await;
    assert!(wait_projection(&patient, |p| p.get(&id).is_some()).await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(patient.dispatcher().refetch_count(), before + 1);
    assert_eq!(patient.appointment_events().stats().attach_count, 1);

    patient.shutdown();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_round_trips_over_the_channel() {
    let hub = start_hub("127.0.0.1:0".parse().expect("addr"), Arc::new(AppointmentStore::new())).await;
    let patient = client(hub.addr, "tok-pat", Role::Patient);
    let channel = patient.start().await.expect("start");
    assert!(wait_connected(&channel, 1).await);

    let mut events = channel.subscribe();
    patient.ping(Some("n-42".to_string())).await.expect("ping");
    let pong = tokio::time::timeout(WAIT, async move {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    if let WireMsg::Pong(payload) = &envelope.msg {
                        return payload.nonce.clone();
                    }
                }
                Err(_) => return None,
            }
        }
    })
    .await
    .expect("pong");
    assert_eq!(pong.as_deref(), Some("n-42"));

    patient.shutdown();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_credential_is_reported_as_a_fault() {
    let hub = start_hub("127.0.0.1:0".parse().expect("addr"), Arc::new(AppointmentStore::new())).await;
    let intruder = client(hub.addr, "tok-expired", Role::Patient);
    let channel = intruder.start().await.expect("channel is still created");
    let mut status = channel.watch_status();
    let rejected = tokio::time::timeout(WAIT, async move {
        status
            .wait_for(|status| {
                matches!(status.last_fault, Some(ChannelFault::AuthRejected { status: 401 }))
            })
            .await
            .is_ok()
    })
    .await
    .unwrap_or(false);
    assert!(rejected);
    assert!(intruder
        .projection()
        .last_error
        .is_some_and(|message| message.contains("401")));

    intruder.shutdown();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_session_means_no_channel() {
    let url = Url::parse("http://127.0.0.1:9").expect("url");
    let config = ClientConfig::new(url, Role::Patient).expect("config");
    let client = CoordinationClient::new(config, Arc::new(StaticToken::none()));
    assert!(matches!(client.start().await, Err(SyncError::NoSession)));
    assert!(client.channel_status().is_none());
}
