use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use chrono::Local;
use pretty_assertions::assert_eq;
use test_context::{test_context, AsyncTestContext};
use testresult::TestResult;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
    sync::{watch, Notify},
    task::JoinHandle,
};

use crate::{
    fabricator::FleetContext,
    job::{payload, NewJob},
    models::PrusaMk3,
    ports::EmulatorHandle,
    protocol::{command_token, ProtocolTimeouts},
    Config, EmulatorRegistry, Event, EventBus, Fabricator, FabricatorError, FabricatorId, FabricatorStatus,
    FleetPorts, Job, JobId, JobStatus, MemoryGateway, PersistenceGateway, PortInfo, Profile, ProtocolError,
    Registry, SharedJob,
};

const PORT: &str = "/dev/emu0";
const PRUSA_HWID: &str = "USB VID:PID=2C99:0002 SER=CZPX1017X004XK12345";
const WAIT: Duration = Duration::from_secs(5);

const GCODE: &str = "; estimated printing time (normal mode) = 0h 1m 0s
G28 ; home all axes
M107
G1 X10 Y10 F36000

G1 X20 Y20
";

/// How the emulated printer answers. Every line gets an `ok` unless its
/// token is `silent`; `hold` tokens are answered once the gate opens and
/// `hang_up` tokens make the device drop the link instead of answering.
#[derive(Debug, Clone, Default)]
struct Script {
    silent: Vec<&'static str>,
    hold: Vec<&'static str>,
    hang_up: Vec<&'static str>,
}

struct Device {
    received: Arc<Mutex<Vec<String>>>,
    links_closed: watch::Receiver<usize>,
    reached: Arc<Notify>,
    gate: Arc<Notify>,
    _task: JoinHandle<()>,
}

impl Device {
    fn spawn(mut handle: EmulatorHandle, script: Script) -> Self {
        let received = Arc::new(Mutex::new(vec![]));
        let (closed_tx, links_closed) = watch::channel(0);
        let reached = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());

        let task = {
            let received = received.clone();
            let reached = reached.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                while let Some(stream) = handle.accept().await {
                    if let Err(e) = serve(stream, &script, &received, &reached, &gate).await {
                        tracing::debug!(error = format!("{:?}", e), "emulated link ended");
                    }
                    closed_tx.send_modify(|closed| *closed += 1);
                }
            })
        };

        Self {
            received,
            links_closed,
            reached,
            gate,
            _task: task,
        }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().expect("received lines lock").clone()
    }

    async fn wait_closed(&mut self, links: usize) -> Result<()> {
        tokio::time::timeout(WAIT, self.links_closed.wait_for(|closed| *closed >= links)).await??;
        Ok(())
    }

    fn links_closed(&self) -> usize {
        *self.links_closed.borrow()
    }
}

async fn serve(
    stream: DuplexStream,
    script: &Script,
    received: &Mutex<Vec<String>>,
    reached: &Notify,
    gate: &Notify,
) -> std::io::Result<()> {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        received.lock().expect("received lines lock").push(line.clone());

        let token = command_token(&line).unwrap_or_default();
        if script.hang_up.contains(&token.as_str()) {
            return Ok(());
        }
        if script.silent.contains(&token.as_str()) {
            continue;
        }
        if script.hold.contains(&token.as_str()) {
            reached.notify_one();
            gate.notified().await;
        }
        write.write_all(b"ok\n").await?;
    }
    Ok(())
}

fn fast_timeouts() -> ProtocolTimeouts {
    ProtocolTimeouts {
        read_timeout_ms: 20,
        retry_backoff_ms: 5,
        motion_secs: 1.0,
        homing_secs: 1.0,
        leveling_secs: 1.0,
        heating_secs: 1.0,
    }
}

struct PrinterContext {
    gateway: Arc<MemoryGateway>,
    emulators: EmulatorRegistry,
    handle: Option<EmulatorHandle>,
    fab: Arc<Fabricator>,
}

impl PrinterContext {
    pub async fn new() -> Result<Self> {
        let gateway = Arc::new(MemoryGateway::new());
        let emulators = EmulatorRegistry::default();
        let handle = emulators.handshake(PORT, "Original Prusa MK3 - CDC", PRUSA_HWID)?;

        let ctx = FleetContext {
            ports: Arc::new(FleetPorts::emulated_only(emulators.clone())),
            gateway: gateway.clone(),
            events: EventBus::default(),
            timeouts: fast_timeouts(),
            baud: 115200,
        };
        let port = PortInfo {
            device_path: PORT.to_owned(),
            description: "Original Prusa MK3 - CDC".to_owned(),
            hardware_id: PRUSA_HWID.to_owned(),
        };
        let fab = Arc::new(Fabricator::new(
            FabricatorId(1),
            "bench mk3",
            port,
            Profile::new(&PrusaMk3),
            ctx,
        ));

        Ok(PrinterContext {
            gateway,
            emulators,
            handle: Some(handle),
            fab,
        })
    }

    fn start_device(&mut self, script: Script) -> Device {
        let handle = self.handle.take().expect("device already started");
        Device::spawn(handle, script)
    }

    /// A registry over this context's emulators and gateway.
    fn registry(&self) -> Registry {
        let config = Config {
            protocol: fast_timeouts(),
            ..Default::default()
        };
        Registry::new(
            &config,
            FleetPorts::emulated_only(self.emulators.clone()),
            self.gateway.clone(),
        )
    }

    async fn insert(&self, name: &str, gcode: &str, status: JobStatus) -> Result<JobId> {
        self.gateway
            .insert_job(NewJob {
                fabricator_id: Some(self.fab.id()),
                name: name.to_owned(),
                file_name_original: format!("{}.gcode", name),
                payload: payload::compress(gcode.as_bytes()),
                favorite: false,
                status,
            })
            .await
    }

    /// Store and queue a job, keeping a handle on it.
    async fn submit(&self, name: &str, gcode: &str) -> Result<SharedJob> {
        let job_id = self.insert(name, gcode, JobStatus::Inqueue).await?;
        let job = Job::new(
            job_id,
            name,
            &format!("{}.gcode", name),
            payload::compress(gcode.as_bytes()),
            false,
        )
        .shared();
        self.fab.enqueue(job.clone()).await?;
        Ok(job)
    }
}

impl AsyncTestContext for PrinterContext {
    async fn setup() -> Self {
        PrinterContext::new().await.unwrap()
    }

    async fn teardown(self) {
        self.emulators.disconnect(PORT);
    }
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut drained = vec![];
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_print_completes(ctx: &mut PrinterContext) -> TestResult {
    let mut device = ctx.start_device(Script::default());
    ctx.fab.initialize().await?;
    assert_eq!(ctx.fab.status(), FabricatorStatus::Ready);

    let job = ctx.submit("cube", GCODE).await?;
    let job_id = job.lock().await.id();
    let mut events = ctx.fab.subscribe();

    assert_eq!(ctx.fab.print_next_in_queue().await?, Some(job_id));
    assert_eq!(ctx.fab.status(), FabricatorStatus::Ready);
    assert_eq!(ctx.fab.current_job_id().await, None);
    assert!(ctx.fab.queue_snapshot().await.is_empty());

    {
        let job = job.lock().await;
        assert_eq!(job.status(), JobStatus::Complete);
        assert_eq!(job.progress(), 1.0);
        assert!(job.time_started());
        assert_eq!(job.time().total_seconds, 60.0);
    }

    let record = ctx.gateway.find_job(job_id).await?.ok_or("job missing")?;
    assert_eq!(record.status, JobStatus::Complete);
    assert_eq!(record.progress, 1.0);

    // The startup link carried the job and was closed afterwards.
    device.wait_closed(1).await?;
    let received = device.received();
    assert_eq!(&received[..3], &["M155 S1", "G90", "M83"]);
    assert!(received.contains(&"G1 X10 Y10 F12000".to_owned()));
    assert!(received.contains(&"G1 X0 Y210 F12000".to_owned()));
    assert_eq!(received.last().map(String::as_str), Some("M84"));

    let events = drain(&mut events);
    assert!(events.contains(&Event::JobStatusUpdate {
        job_id,
        status: JobStatus::Printing
    }));
    assert!(events.contains(&Event::JobStatusUpdate {
        job_id,
        status: JobStatus::Complete
    }));
    assert!(events.iter().any(|e| matches!(e, Event::SetTime { index: 1, .. })));
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_print_times_out(ctx: &mut PrinterContext) -> TestResult {
    let mut device = ctx.start_device(Script {
        silent: vec!["M400"],
        ..Default::default()
    });
    ctx.fab.initialize().await?;

    let job = ctx.submit("stall", "G28\nG1 X10\nM400\nG1 X20\n").await?;
    let job_id = job.lock().await.id();
    let next = ctx.submit("next", "G28\n").await?;
    let next_id = next.lock().await.id();

    let err = ctx.fab.print_next_in_queue().await.unwrap_err();
    match err {
        FabricatorError::Protocol(ProtocolError::Timeout { ref command, .. }) => assert_eq!(command, "M400"),
        other => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(ctx.fab.status(), FabricatorStatus::Error);
    assert_eq!(ctx.fab.current_job_id().await, Some(job_id));
    {
        let job = job.lock().await;
        assert_eq!(job.status(), JobStatus::Error);
        let issue = job.issue().ok_or("issue missing")?;
        assert!(issue.description.contains("M400"));
        assert!(issue.id.is_some());
    }

    let issues = ctx.gateway.issues().await;
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].job_id, Some(job_id));
    let record = ctx.gateway.find_job(job_id).await?.ok_or("job missing")?;
    assert_eq!(record.status, JobStatus::Error);
    assert_eq!(record.issue_id, issues[0].id);

    device.wait_closed(1).await?;
    assert!(!device.received().contains(&"G1 X20".to_owned()));

    // The failed job is gone; the rest of the queue waits for an operator.
    assert_eq!(ctx.fab.queue_snapshot().await, vec![next_id]);
    assert!(matches!(
        ctx.fab.print_next_in_queue().await,
        Err(FabricatorError::InvalidState { .. })
    ));

    let mut events = ctx.fab.subscribe();
    ctx.fab.release().await?;
    assert_eq!(ctx.fab.status(), FabricatorStatus::Ready);
    assert_eq!(ctx.fab.current_job_id().await, None);
    assert_eq!(
        drain(&mut events),
        vec![Event::ReleaseJob {
            job_id,
            released: true
        }]
    );
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_queue_restore_demotes_printing(ctx: &mut PrinterContext) -> TestResult {
    let printing = ctx.insert("a", "G28\n", JobStatus::Printing).await?;
    let queued = ctx.insert("b", "G28\n", JobStatus::Inqueue).await?;
    ctx.insert("c", "G28\n", JobStatus::Complete).await?;

    // A record whose payload was scrubbed has nothing left to print.
    let scrubbed = ctx.insert("d", "G28\n", JobStatus::Complete).await?;
    ctx.gateway.clear_space(Local::now() + chrono::Duration::days(1)).await?;
    ctx.gateway.update_job_status(scrubbed, JobStatus::Printing).await?;

    let registry = ctx.registry();
    assert_eq!(registry.queue_restore(&ctx.fab).await?, 2);
    assert_eq!(ctx.fab.queue_snapshot().await, vec![printing, queued]);

    for job_id in [printing, queued] {
        let record = ctx.gateway.find_job(job_id).await?.ok_or("job missing")?;
        assert_eq!(record.status, JobStatus::Inqueue);
    }

    // Restoring again adds nothing.
    assert_eq!(registry.queue_restore(&ctx.fab).await?, 0);
    assert_eq!(ctx.fab.queue_snapshot().await, vec![printing, queued]);
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_pause_freezes_progress_and_extends_eta(ctx: &mut PrinterContext) -> TestResult {
    let device = ctx.start_device(Script {
        hold: vec!["G4"],
        ..Default::default()
    });
    ctx.fab.initialize().await?;

    let job = ctx
        .submit(
            "dwell",
            "; estimated printing time (normal mode) = 0h 1m 0s\nG28\nM107\nG1 X1\nG4 S1\nG1 X2\nG1 X3\n",
        )
        .await?;
    let job_id = job.lock().await.id();

    let fab = ctx.fab.clone();
    let print = tokio::spawn(async move { fab.print_next_in_queue().await });

    tokio::time::timeout(WAIT, device.reached.notified()).await?;
    ctx.fab.pause().await?;
    assert_eq!(ctx.fab.status(), FabricatorStatus::Paused);

    let frozen = {
        let job = job.lock().await;
        assert_eq!(job.status(), JobStatus::Paused);
        assert!(job.paused());
        assert_eq!(job.time().total_seconds, 60.0);
        job.progress()
    };
    assert_eq!(frozen, 0.5);

    // Let the in-flight dwell finish; nothing else may be sent.
    device.gate.notify_one();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(job.lock().await.progress(), frozen);
    assert!(!device.received().contains(&"G1 X2".to_owned()));

    ctx.fab.resume().await?;
    assert_eq!(tokio::time::timeout(WAIT, print).await???, Some(job_id));

    let job = job.lock().await;
    assert_eq!(job.status(), JobStatus::Complete);
    assert_eq!(job.progress(), 1.0);

    let time = job.time();
    assert!(time.total_seconds >= 60.2, "total was {}", time.total_seconds);
    let started = time.started_at.ok_or("clock not started")?;
    let eta = time.eta.ok_or("no eta")?;
    let span = (eta - started).num_milliseconds() as f64 / 1000.0;
    assert!((span - time.total_seconds).abs() < 0.01, "{} vs {}", span, time.total_seconds);
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_cancel_paused_job(ctx: &mut PrinterContext) -> TestResult {
    let mut device = ctx.start_device(Script {
        hold: vec!["G4"],
        ..Default::default()
    });
    ctx.fab.initialize().await?;

    let job = ctx.submit("dwell", "G28\nG4 S1\nG1 X2\n").await?;
    let job_id = job.lock().await.id();

    let fab = ctx.fab.clone();
    let print = tokio::spawn(async move { fab.print_next_in_queue().await });

    tokio::time::timeout(WAIT, device.reached.notified()).await?;
    ctx.fab.pause().await?;
    ctx.fab.cancel().await?;
    device.gate.notify_one();

    assert_eq!(tokio::time::timeout(WAIT, print).await???, Some(job_id));
    assert_eq!(ctx.fab.status(), FabricatorStatus::Ready);
    {
        let job = job.lock().await;
        assert_eq!(job.status(), JobStatus::Error);
        assert!(!job.paused());
        assert_eq!(job.issue().map(|i| i.description.as_str()), Some("cancelled by operator"));
    }

    device.wait_closed(1).await?;
    let received = device.received();
    assert!(!received.contains(&"G1 X2".to_owned()));
    let cancel_at = received.iter().position(|l| l == "M603").ok_or("cancel not sent")?;
    assert_eq!(&received[cancel_at + 1..], &["M104 S0", "M140 S0", "M107", "G1 X0 Y210 F12000", "M84"]);
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_startup_failure_keeps_link(ctx: &mut PrinterContext) -> TestResult {
    let device = ctx.start_device(Script {
        silent: vec!["M83"],
        ..Default::default()
    });

    let err = ctx.fab.initialize().await.unwrap_err();
    assert!(matches!(err, FabricatorError::Protocol(ProtocolError::Timeout { .. })));
    assert_eq!(ctx.fab.status(), FabricatorStatus::Error);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(device.links_closed(), 0);

    let issues = ctx.gateway.issues().await;
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].job_id, None);
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_persistence_failure_does_not_roll_back(ctx: &mut PrinterContext) -> TestResult {
    let _device = ctx.start_device(Script::default());
    ctx.fab.initialize().await?;
    let job = ctx.submit("cube", GCODE).await?;

    ctx.gateway.set_failing(true);
    assert!(ctx.fab.print_next_in_queue().await?.is_some());
    assert_eq!(ctx.fab.status(), FabricatorStatus::Ready);
    assert_eq!(job.lock().await.status(), JobStatus::Complete);

    ctx.gateway.set_failing(false);
    let job_id = job.lock().await.id();
    let record = ctx.gateway.find_job(job_id).await?.ok_or("job missing")?;
    assert_eq!(record.status, JobStatus::Inqueue);
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_fleet_drives_submitted_job(ctx: &mut PrinterContext) -> TestResult {
    let _device = ctx.start_device(Script::default());
    let registry = ctx.registry();

    let fab = registry.discover().await?.pop().ok_or("device not discovered")?;
    assert_eq!(fab.profile().descriptor().model, "MK3");
    assert_eq!(registry.fabricators().await.len(), 1);
    assert!(registry.get(fab.id()).await.is_some());

    let mut status = fab.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == FabricatorStatus::Ready)).await??;

    let mut events = fab.subscribe();
    let job_id = fab.submit("cube", "cube.gcode", GCODE.as_bytes(), false).await?;
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(Event::JobStatusUpdate { job_id: id, status }) if id == job_id && status == JobStatus::Complete => {
                    return Ok::<_, tokio::sync::broadcast::error::RecvError>(())
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    })
    .await??;
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == FabricatorStatus::Ready)).await??;

    // A second scan finds nothing new.
    assert!(registry.discover().await?.is_empty());

    // Unplugging takes the idle fabricator offline.
    ctx.emulators.disconnect(PORT);
    registry.discover().await?;
    assert_eq!(fab.status(), FabricatorStatus::Offline);

    registry.shutdown().await;
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_link_lost_mid_print(ctx: &mut PrinterContext) -> TestResult {
    let mut device = ctx.start_device(Script {
        hang_up: vec!["M400"],
        ..Default::default()
    });
    ctx.fab.initialize().await?;

    let job = ctx.submit("unplugged", "G28\nG1 X10\nM400\nG1 X20\n").await?;
    let job_id = job.lock().await.id();

    let err = ctx.fab.print_next_in_queue().await.unwrap_err();
    match err {
        FabricatorError::Protocol(ProtocolError::Closed { ref command }) => assert_eq!(command, "M400"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(ctx.fab.status(), FabricatorStatus::Offline);

    {
        let job = job.lock().await;
        assert_eq!(job.status(), JobStatus::Error);
        let issue = job.issue().ok_or("issue missing")?;
        assert!(issue.description.contains("M400"));
        assert_eq!(issue.job_id, Some(job_id));
    }
    let record = ctx.gateway.find_job(job_id).await?.ok_or("job missing")?;
    assert_eq!(record.status, JobStatus::Error);
    assert!(record.issue_id.is_some());

    // The link is gone from the fabricator, not parked for reuse.
    device.wait_closed(1).await?;
    assert!(matches!(
        ctx.fab.reset(false).await,
        Err(FabricatorError::Connection { .. })
    ));
    assert!(!device.received().contains(&"G1 X20".to_owned()));
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_drive_loop_waits_for_release(ctx: &mut PrinterContext) -> TestResult {
    let _device = ctx.start_device(Script {
        silent: vec!["M400"],
        ..Default::default()
    });
    let registry = ctx.registry();
    let fab = registry.discover().await?.pop().ok_or("device not discovered")?;

    let mut status = fab.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == FabricatorStatus::Ready)).await??;

    let mut events = fab.subscribe();
    let failing = fab.submit("stall", "stall.gcode", b"G28\nM400\n", false).await?;
    let next = fab.submit("cube", "cube.gcode", b"G28\nG1 X1\n", false).await?;

    tokio::time::timeout(WAIT, status.wait_for(|s| *s == FabricatorStatus::Error)).await??;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Nothing moves on while the failed job awaits an operator.
    assert_eq!(fab.status(), FabricatorStatus::Error);
    assert_eq!(fab.current_job_id().await, Some(failing));
    assert_eq!(fab.queue_snapshot().await, vec![next]);
    let record = ctx.gateway.find_job(next).await?.ok_or("job missing")?;
    assert_eq!(record.status, JobStatus::Inqueue);

    fab.release().await?;
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(Event::JobStatusUpdate { job_id, status }) if job_id == next && status == JobStatus::Complete => {
                    return Ok::<_, tokio::sync::broadcast::error::RecvError>(())
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    })
    .await??;

    let record = ctx.gateway.find_job(failing).await?.ok_or("job missing")?;
    assert_eq!(record.status, JobStatus::Error);

    registry.shutdown().await;
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_discover_survives_registration_failure(ctx: &mut PrinterContext) -> TestResult {
    let _device = ctx.start_device(Script::default());
    let registry = ctx.registry();
    let fab = registry.discover().await?.pop().ok_or("device not discovered")?;
    let mut status = fab.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == FabricatorStatus::Ready)).await??;

    // The store goes down while one device is swapped for another.
    ctx.gateway.set_failing(true);
    let _second = ctx
        .emulators
        .handshake("/dev/emu1", "Original Prusa MK3 - CDC", "USB VID:PID=2C99:0002 SER=CZPX2222")?;
    ctx.emulators.disconnect(PORT);

    assert!(registry.discover().await?.is_empty());
    assert_eq!(fab.status(), FabricatorStatus::Offline);
    assert_eq!(registry.fabricators().await.len(), 1);

    // Once the store is back the new device is picked up.
    ctx.gateway.set_failing(false);
    let added = registry.discover().await?;
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].device_path(), "/dev/emu1");

    registry.shutdown().await;
    Ok(())
}

#[test_context(PrinterContext)]
#[tokio::test]
async fn test_print_with_off_calendar_estimate(ctx: &mut PrinterContext) -> TestResult {
    let _device = ctx.start_device(Script::default());
    ctx.fab.initialize().await?;

    let job = ctx
        .submit("forever", ";FLAVOR:Marlin\n;TIME:10000000000000\nG28\nM107\nG1 X1\n")
        .await?;
    assert!(ctx.fab.print_next_in_queue().await?.is_some());
    assert_eq!(ctx.fab.status(), FabricatorStatus::Ready);

    let job = job.lock().await;
    assert_eq!(job.status(), JobStatus::Complete);
    assert!(job.time_started());
    assert_eq!(job.time().eta, None);
    Ok(())
}
