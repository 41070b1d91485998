//! Runs the policy checker against compiled class directories.
//!
//! A scan never shares mutable state with the caller: the checker runs either
//! in a worker process (`jpack scan-worker`) that speaks JSON lines over
//! stdio, or on a blocking thread that sends owned events over a channel.
//! Either way the caller sees the same stream of [`WorkerEvent`]s.

use std::{
    any::Any,
    collections::HashSet,
    io::{Read, Write},
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
    task::JoinSet,
};
use tracing::{debug, info, warn_span};

use crate::{
    errors::{PackError, Result},
    policy::{Checker, PolicyConfig, TracingLog, ViolationListener},
    report::{
        report_file_name, CallSite, ScanOutcome, Severity, Violation, ViolationAggregator,
        ViolationReport,
    },
};

/// Where the checker executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// A blocking thread of this process; panics are contained.
    InProcess,
    /// A child process started as `program args...` that serves one request.
    Worker { program: PathBuf, args: Vec<String> },
}

/// What a worker is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Version of the requesting binary; workers refuse a mismatch.
    pub engine: String,
    pub compiled_dir: PathBuf,
    pub classpath: Vec<PathBuf>,
    pub policy: PolicyConfig,
}

impl ScanRequest {
    pub fn new(compiled_dir: &Path, classpath: &[PathBuf], policy: &PolicyConfig) -> Self {
        Self {
            engine: crate::version().to_string(),
            compiled_dir: compiled_dir.to_path_buf(),
            classpath: classpath.to_vec(),
            policy: policy.clone(),
        }
    }
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Violation {
        restricted: String,
        call_site: CallSite,
    },
    Finished {
        classes: usize,
    },
    Failed {
        message: String,
    },
}

struct EventListener<'a> {
    emit: &'a mut dyn FnMut(WorkerEvent),
}

impl ViolationListener for EventListener<'_> {
    fn on_violation(&mut self, violation: Violation) {
        (self.emit)(WorkerEvent::Violation {
            restricted: violation.restricted,
            call_site: violation.call_site,
        });
    }
}

/// Runs one request to completion, emitting a `Violation` event per finding.
pub fn run_check(request: &ScanRequest, emit: &mut dyn FnMut(WorkerEvent)) -> Result<usize> {
    if request.engine != crate::version() {
        return Err(PackError::scan(
            &request.compiled_dir,
            format!(
                "scan worker is version {} but the request came from {}",
                crate::version(),
                request.engine
            ),
        ));
    }
    let log = TracingLog;
    let checker = Checker::new(&request.classpath, request.policy.clone(), &log)?;
    checker.check(&request.compiled_dir, &mut EventListener { emit })
}

/// Serves a single request read from `input`, writing JSON lines to `output`.
///
/// The last event is always `Finished` or `Failed`.
pub fn run_worker<R: Read, W: Write>(mut input: R, mut output: W) -> Result<()> {
    let mut raw = String::new();
    input
        .read_to_string(&mut raw)
        .map_err(|err| PackError::io("<stdin>", err))?;
    let request: ScanRequest = match serde_json::from_str(&raw) {
        Ok(request) => request,
        Err(err) => {
            let err = PackError::scan("<stdin>", format!("invalid scan request: {err}"));
            let failed = WorkerEvent::Failed {
                message: err.to_string(),
            };
            write_event(&mut output, &failed).map_err(|io| PackError::io("<stdout>", io))?;
            return Err(err);
        }
    };

    let mut write_error = None;
    let mut emit = |event: WorkerEvent| {
        if write_error.is_none() {
            if let Err(err) = write_event(&mut output, &event) {
                write_error = Some(err);
            }
        }
    };
    let result = run_check(&request, &mut emit);
    match &result {
        Ok(classes) => emit(WorkerEvent::Finished { classes: *classes }),
        Err(err) => emit(WorkerEvent::Failed {
            message: err.to_string(),
        }),
    }
    if let Some(err) = write_error {
        return Err(PackError::io("<stdout>", err));
    }
    output.flush().map_err(|err| PackError::io("<stdout>", err))?;
    result.map(|_| ())
}

fn write_event<W: Write>(output: &mut W, event: &WorkerEvent) -> std::io::Result<()> {
    serde_json::to_writer(&mut *output, event)?;
    output.write_all(b"\n")
}

/// Result of scanning one compiled directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryScan {
    pub dir: PathBuf,
    pub classes: usize,
    pub report: ViolationReport,
}

impl DirectoryScan {
    /// Writes the rendered report into `output_dir`; clean scans leave an empty file.
    pub fn write_report(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(report_file_name(&self.dir));
        self.report.write_to(&path)?;
        Ok(path)
    }
}

/// Writes one report per scan into `output_dir`.
///
/// Directories whose paths flatten to the same file name get `-2`, `-3`, ...
/// suffixes in scan order, so no report overwrites another.
pub fn write_reports(scans: &[DirectoryScan], output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut taken = HashSet::new();
    let mut written = Vec::with_capacity(scans.len());
    for scan in scans {
        let base = report_file_name(&scan.dir);
        let stem = base
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut name = base;
        let mut attempt = 1;
        while !taken.insert(name.clone()) {
            attempt += 1;
            name = PathBuf::from(format!("{stem}-{attempt}.txt"));
        }
        let path = output_dir.join(name);
        scan.report.write_to(&path)?;
        written.push(path);
    }
    Ok(written)
}

/// Applies the failure policy to every scan.
///
/// Tolerated violations are logged per directory. All directories with
/// enforced violations fail together in one error, each report headed by its
/// directory.
pub fn enforce_all(scans: &[DirectoryScan], ignore_failures: bool) -> Result<()> {
    let mut failed = Vec::new();
    for scan in scans {
        match scan.report.clone().outcome(ignore_failures) {
            ScanOutcome::Clean => {}
            ScanOutcome::Violations {
                report,
                severity: Severity::Error,
            } => failed.push(format!("{}:\n{}", scan.dir.display(), report.rendered_text())),
            warned => {
                let _span = warn_span!("restricted_api_scan", dir = %scan.dir.display()).entered();
                warned.enforce()?;
            }
        }
    }
    if failed.is_empty() {
        return Ok(());
    }
    Err(PackError::RestrictedApiViolation {
        report: failed.join("\n\n"),
    })
}

#[derive(Debug, Clone)]
pub struct RestrictedApiScanner {
    policy: Arc<PolicyConfig>,
    isolation: Arc<Isolation>,
}

impl RestrictedApiScanner {
    pub fn new(policy: PolicyConfig, isolation: Isolation) -> Self {
        Self {
            policy: Arc::new(policy),
            isolation: Arc::new(isolation),
        }
    }

    /// Scans `compiled_dir` with restrictions drawn from `classpath`.
    ///
    /// A directory that does not exist has nothing to scan and yields an empty
    /// report.
    pub async fn scan(&self, compiled_dir: &Path, classpath: &[PathBuf]) -> Result<DirectoryScan> {
        if !compiled_dir.exists() {
            debug!(dir = %compiled_dir.display(), "compiled directory missing, nothing to scan");
            return Ok(DirectoryScan {
                dir: compiled_dir.to_path_buf(),
                classes: 0,
                report: ViolationReport::default(),
            });
        }

        let request = ScanRequest::new(compiled_dir, classpath, &self.policy);
        let mut aggregator = ViolationAggregator::new();
        let classes = match self.isolation.as_ref() {
            Isolation::InProcess => scan_on_thread(request, &mut aggregator).await?,
            Isolation::Worker { program, args } => {
                scan_in_worker(program, args, &request, &mut aggregator).await?
            }
        };
        let report = aggregator.report();
        metrics::counter!("jpack_violations_total").increment(report.call_site_count() as u64);
        info!(
            dir = %compiled_dir.display(),
            classes,
            violations = report.call_site_count(),
            "restricted API scan finished"
        );
        Ok(DirectoryScan {
            dir: compiled_dir.to_path_buf(),
            classes,
            report,
        })
    }

    /// Scans every directory concurrently, one task each, against a shared
    /// classpath made of the existing directories followed by `dependencies`.
    /// Results come back in the order of `dirs`.
    pub async fn scan_all(
        &self,
        dirs: &[PathBuf],
        dependencies: &[PathBuf],
    ) -> Result<Vec<DirectoryScan>> {
        let classpath: Arc<Vec<PathBuf>> = Arc::new(
            dirs.iter()
                .filter(|dir| dir.exists())
                .chain(dependencies)
                .cloned()
                .collect(),
        );

        let mut tasks = JoinSet::new();
        for (position, dir) in dirs.iter().cloned().enumerate() {
            let scanner = self.clone();
            let classpath = Arc::clone(&classpath);
            tasks.spawn(async move { (position, scanner.scan(&dir, &classpath).await) });
        }

        let mut scans = Vec::with_capacity(dirs.len());
        while let Some(joined) = tasks.join_next().await {
            let (position, result) = joined
                .map_err(|err| PackError::scan("<scan task>", format!("task aborted: {err}")))?;
            scans.push((position, result?));
        }
        scans.sort_by_key(|(position, _)| *position);
        Ok(scans.into_iter().map(|(_, scan)| scan).collect())
    }
}

fn apply(event: WorkerEvent, aggregator: &mut ViolationAggregator) -> Option<WorkerEvent> {
    match event {
        WorkerEvent::Violation {
            restricted,
            call_site,
        } => {
            aggregator.record(Violation {
                restricted,
                call_site,
            });
            None
        }
        terminal => Some(terminal),
    }
}

async fn scan_on_thread(request: ScanRequest, aggregator: &mut ViolationAggregator) -> Result<usize> {
    let dir = request.compiled_dir.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::task::spawn_blocking(move || {
        panic::catch_unwind(AssertUnwindSafe(|| {
            run_check(&request, &mut |event: WorkerEvent| {
                let _ = tx.send(event);
            })
        }))
    });

    while let Some(event) = rx.recv().await {
        apply(event, aggregator);
    }
    match handle.await {
        Ok(Ok(Ok(classes))) => Ok(classes),
        Ok(Ok(Err(err))) => Err(PackError::scan(dir, err.to_string())),
        Ok(Err(payload)) => Err(PackError::scan(
            dir,
            format!("checker panicked: {}", panic_message(payload.as_ref())),
        )),
        Err(err) => Err(PackError::scan(dir, format!("scan thread failed: {err}"))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn scan_in_worker(
    program: &Path,
    args: &[String],
    request: &ScanRequest,
    aggregator: &mut ViolationAggregator,
) -> Result<usize> {
    let dir = &request.compiled_dir;
    let payload = serde_json::to_vec(request)
        .map_err(|err| PackError::scan(dir, format!("cannot encode scan request: {err}")))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            PackError::scan(dir, format!("cannot start scan worker {}: {err}", program.display()))
        })?;
    debug!(dir = %dir.display(), pid = ?child.id(), "scan worker started");

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| PackError::scan(dir, "scan worker stdin unavailable"))?;
    stdin
        .write_all(&payload)
        .await
        .map_err(|err| PackError::scan(dir, format!("cannot send scan request: {err}")))?;
    drop(stdin);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PackError::scan(dir, "scan worker stdout unavailable"))?;
    let mut lines = BufReader::new(stdout).lines();
    let mut terminal = None;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|err| PackError::scan(dir, format!("cannot read scan worker output: {err}")))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let event: WorkerEvent = serde_json::from_str(&line).map_err(|err| {
            PackError::scan(dir, format!("unexpected scan worker output `{line}`: {err}"))
        })?;
        if let Some(event) = apply(event, aggregator) {
            terminal = Some(event);
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| PackError::scan(dir, format!("cannot reap scan worker: {err}")))?;
    match terminal {
        Some(WorkerEvent::Failed { message }) => Err(PackError::scan(dir, message)),
        Some(WorkerEvent::Finished { classes }) if status.success() => Ok(classes),
        _ => Err(PackError::scan(
            dir,
            format!("scan worker exited with {status} before finishing"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::classfile::writer::{AnnotationSpec, ClassWriter, MethodSpec};

    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let lib = root.path().join("lib");
        let classes = root.path().join("classes");
        fs::create_dir_all(lib.join("hudson")).unwrap();
        fs::create_dir_all(classes.join("org/example")).unwrap();
        fs::write(
            lib.join("hudson/Util.class"),
            ClassWriter::new("hudson/Util")
                .method(
                    MethodSpec::new("fixEmpty", "(Ljava/lang/String;)Ljava/lang/String;")
                        .annotate(AnnotationSpec::restricted(&["NoExternalUse"])),
                )
                .finish(),
        )
        .unwrap();
        fs::write(
            classes.join("org/example/Builder.class"),
            ClassWriter::new("org/example/Builder")
                .extends("java/lang/Object")
                .method(
                    MethodSpec::new("perform", "()V")
                        .line(42)
                        .invoke_static("hudson/Util", "fixEmpty", "(Ljava/lang/String;)Ljava/lang/String;")
                        .line(43)
                        .invoke_static("hudson/Util", "fixEmpty", "(Ljava/lang/String;)Ljava/lang/String;"),
                )
                .finish(),
        )
        .unwrap();
        (root, lib, classes)
    }

    #[tokio::test]
    async fn in_process_scan_collects_violations() {
        let (_root, lib, classes) = fixture();
        let scanner = RestrictedApiScanner::new(PolicyConfig::default(), Isolation::InProcess);
        let scan = scanner.scan(&classes, &[lib, classes.clone()]).await.unwrap();

        assert_eq!(scan.classes, 1);
        assert_eq!(
            scan.report.rendered_text(),
            "hudson.Util.fixEmpty(Ljava/lang/String;)Ljava/lang/String; must not be used\n\
             \tbut was used on 2 lines:\n\
             \t\t- org.example.Builder:42\n\
             \t\t- org.example.Builder:43"
        );
    }

    #[tokio::test]
    async fn empty_directory_is_clean() {
        let root = tempfile::tempdir().unwrap();
        let scanner = RestrictedApiScanner::new(PolicyConfig::default(), Isolation::InProcess);
        let scan = scanner.scan(root.path(), &[]).await.unwrap();
        assert_eq!(scan.classes, 0);
        assert!(!scan.report.has_violations());
    }

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        let scanner = RestrictedApiScanner::new(PolicyConfig::default(), Isolation::InProcess);
        let scan = scanner.scan(&root.path().join("absent"), &[]).await.unwrap();
        assert!(!scan.report.has_violations());
    }

    #[tokio::test]
    async fn checker_failures_become_internal_errors() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("Broken.class"), b"junk").unwrap();
        let scanner = RestrictedApiScanner::new(PolicyConfig::default(), Isolation::InProcess);
        let err = scanner.scan(root.path(), &[]).await.unwrap_err();
        match err {
            PackError::ScanInternal { dir, message } => {
                assert_eq!(dir, root.path());
                assert!(message.contains("Broken.class"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn scan_all_keeps_input_order() {
        let (root, lib, classes) = fixture();
        let missing = root.path().join("test-classes");
        let scanner = RestrictedApiScanner::new(PolicyConfig::default(), Isolation::InProcess);
        let scans = scanner
            .scan_all(&[missing.clone(), classes.clone()], &[lib])
            .await
            .unwrap();

        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].dir, missing);
        assert!(!scans[0].report.has_violations());
        assert_eq!(scans[1].dir, classes);
        assert_eq!(scans[1].report.call_site_count(), 2);

        let out = root.path().join("reports");
        let written = scans[1].write_report(&out).unwrap();
        assert!(fs::read_to_string(written).unwrap().contains("org.example.Builder:42"));
    }

    #[tokio::test]
    async fn worker_that_cannot_start_is_an_internal_error() {
        let root = tempfile::tempdir().unwrap();
        let scanner = RestrictedApiScanner::new(
            PolicyConfig::default(),
            Isolation::Worker {
                program: root.path().join("no-such-binary"),
                args: vec!["scan-worker".into()],
            },
        );
        let err = scanner.scan(root.path(), &[]).await.unwrap_err();
        assert!(matches!(err, PackError::ScanInternal { .. }));
    }

    fn scripted_worker(script: &str) -> RestrictedApiScanner {
        RestrictedApiScanner::new(
            PolicyConfig::default(),
            Isolation::Worker {
                program: PathBuf::from("sh"),
                args: vec!["-c".into(), format!("cat >/dev/null; {script}")],
            },
        )
    }

    #[tokio::test]
    async fn worker_events_feed_the_report() {
        let root = tempfile::tempdir().unwrap();
        let scanner = scripted_worker(
            r#"echo '{"event":"violation","restricted":"X must not be used","call_site":{"class_name":"a.B","line":7}}'
               echo ''
               echo '{"event":"violation","restricted":"X must not be used","call_site":{"class_name":"a.B","line":7}}'
               echo '{"event":"finished","classes":4}'"#,
        );
        let scan = scanner.scan(root.path(), &[]).await.unwrap();
        assert_eq!(scan.classes, 4);
        assert_eq!(
            scan.report.rendered_text(),
            "X must not be used\n\tbut was used on 1 line:\n\t\t- a.B:7"
        );
    }

    #[tokio::test]
    async fn worker_failure_event_is_an_internal_error() {
        let root = tempfile::tempdir().unwrap();
        let scanner = scripted_worker(r#"echo '{"event":"failed","message":"index exploded"}'"#);
        match scanner.scan(root.path(), &[]).await.unwrap_err() {
            PackError::ScanInternal { dir, message } => {
                assert_eq!(dir, root.path());
                assert_eq!(message, "index exploded");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_exiting_without_finishing_is_an_internal_error() {
        let root = tempfile::tempdir().unwrap();
        let scanner = scripted_worker("exit 3");
        match scanner.scan(root.path(), &[]).await.unwrap_err() {
            PackError::ScanInternal { message, .. } => {
                assert!(message.contains("before finishing"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_garbage_output_is_an_internal_error() {
        let root = tempfile::tempdir().unwrap();
        let scanner = scripted_worker("echo 'not json'");
        let err = scanner.scan(root.path(), &[]).await.unwrap_err();
        assert!(matches!(err, PackError::ScanInternal { message, .. } if message.contains("not json")));
    }

    fn directory_scan(dir: &str, restricted: &str) -> DirectoryScan {
        DirectoryScan {
            dir: PathBuf::from(dir),
            classes: 1,
            report: crate::report::aggregate([Violation {
                restricted: restricted.into(),
                call_site: CallSite::new("a.B", Some(1)),
            }]),
        }
    }

    #[test]
    fn colliding_report_names_are_disambiguated() {
        let out = tempfile::tempdir().unwrap();
        let scans = [
            directory_scan("a_b/c", "X must not be used"),
            directory_scan("a/b_c", "Y must not be used"),
            directory_scan("a/b/c", "Z must not be used"),
        ];
        let written = write_reports(&scans, out.path()).unwrap();
        let names: Vec<_> = written
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_b_c.txt", "a_b_c-2.txt", "a_b_c-3.txt"]);
        assert!(fs::read_to_string(&written[1]).unwrap().starts_with("Y must not be used"));
    }

    #[test]
    fn enforce_all_reports_every_failing_directory() {
        let scans = [
            directory_scan("build/classes/main", "X must not be used"),
            DirectoryScan {
                dir: PathBuf::from("build/classes/groovy"),
                classes: 0,
                report: ViolationReport::default(),
            },
            directory_scan("build/classes/test", "Y is still in beta"),
        ];
        match enforce_all(&scans, false).unwrap_err() {
            PackError::RestrictedApiViolation { report } => assert_eq!(
                report,
                "build/classes/main:\n\
                 X must not be used\n\
                 \tbut was used on 1 line:\n\
                 \t\t- a.B:1\n\
                 \n\
                 build/classes/test:\n\
                 Y is still in beta\n\
                 \tbut was used on 1 line:\n\
                 \t\t- a.B:1"
            ),
            other => panic!("unexpected error {other:?}"),
        }
        enforce_all(&scans, true).unwrap();
    }

    #[test]
    fn worker_protocol_streams_events_then_finishes() {
        let (_root, lib, classes) = fixture();
        let request = ScanRequest::new(&classes, &[lib], &PolicyConfig::default());
        let input = serde_json::to_vec(&request).unwrap();
        let mut output = Vec::new();
        run_worker(input.as_slice(), &mut output).unwrap();

        let events: Vec<WorkerEvent> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            WorkerEvent::Violation {
                restricted: "hudson.Util.fixEmpty(Ljava/lang/String;)Ljava/lang/String; must not be used"
                    .into(),
                call_site: CallSite::new("org.example.Builder", Some(42)),
            }
        );
        assert_eq!(events[2], WorkerEvent::Finished { classes: 1 });
    }

    #[test]
    fn worker_reports_failures_as_last_event() {
        let mut request = ScanRequest::new(Path::new("classes"), &[], &PolicyConfig::default());
        request.engine = "0.0.0-other".into();
        let input = serde_json::to_vec(&request).unwrap();
        let mut output = Vec::new();
        assert!(run_worker(input.as_slice(), &mut output).is_err());

        let text = String::from_utf8(output).unwrap();
        let last: WorkerEvent = serde_json::from_str(text.lines().last().unwrap()).unwrap();
        assert!(matches!(last, WorkerEvent::Failed { message } if message.contains("0.0.0-other")));
    }
}
