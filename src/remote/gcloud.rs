use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::remote::{
    shell_quote, Inventory, MachineIdentity, MachineRecord, ProcessUsage, RemoteError, RemoteHost,
};

const GCLOUD: &str = "gcloud";
const ALIVE_MARKER: &str = "alive";
const GONE_MARKER: &str = "gone";

/// Talks to one Compute Engine VM through `gcloud compute ssh` / `scp`.
#[derive(Debug, Clone)]
pub struct GcloudRemote {
    identity: MachineIdentity,
    program: String,
}

impl GcloudRemote {
    pub fn new(identity: MachineIdentity) -> Self {
        Self {
            identity,
            program: GCLOUD.to_string(),
        }
    }

    /// Use a different executable in place of `gcloud`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    fn location_args(&self) -> [String; 4] {
        [
            "--zone".to_string(),
            self.identity.zone.clone(),
            "--project".to_string(),
            self.identity.project.clone(),
        ]
    }

    async fn ssh(&self, remote_command: &str) -> Result<String, RemoteError> {
        let mut args = vec![
            "compute".to_string(),
            "ssh".to_string(),
            self.identity.name.clone(),
        ];
        args.extend(self.location_args());
        args.push("--command".to_string());
        args.push(remote_command.to_string());
        run_command(&self.program, &args).await
    }

    async fn scp(&self, from: String, to: String) -> Result<(), RemoteError> {
        let mut args = vec!["compute".to_string(), "scp".to_string(), from, to];
        args.extend(self.location_args());
        run_command(&self.program, &args).await.map(|_| ())
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{}", self.identity.name, path)
    }
}

#[async_trait]
impl RemoteHost for GcloudRemote {
    async fn query_utilization(&self) -> Result<Vec<u8>, RemoteError> {
        let stdout = self
            .ssh("nvidia-smi --query-gpu=utilization.gpu --format=csv,noheader,nounits")
            .await?;
        parse_utilization(&stdout)
    }

    async fn is_process_alive(&self, pid: u32) -> Result<bool, RemoteError> {
        let stdout = self
            .ssh(&format!(
                "if ps -p {pid} > /dev/null 2>&1; then echo {ALIVE_MARKER}; else echo {GONE_MARKER}; fi"
            ))
            .await?;
        parse_liveness(&stdout)
    }

    async fn list_child_processes(&self, pid: u32) -> Result<Vec<u32>, RemoteError> {
        let stdout = self.ssh("ps -eo pid=,ppid=").await?;
        Ok(descendants(&parse_process_table(&stdout), pid))
    }

    async fn query_process_utilization(&self) -> Result<Vec<ProcessUsage>, RemoteError> {
        let stdout = self.ssh("nvidia-smi pmon -c 1").await?;
        Ok(parse_pmon(&stdout))
    }

    async fn copy_file_to(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        self.scp(local.display().to_string(), self.remote_spec(remote))
            .await
    }

    async fn copy_file_from(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        self.scp(self.remote_spec(remote), local.display().to_string())
            .await
    }

    async fn launch_background(
        &self,
        command: &str,
        timeout_secs: u64,
    ) -> Result<u32, RemoteError> {
        let stdout = self
            .ssh(&format!(
                "nohup timeout {timeout_secs} {command} < /dev/null & echo $!"
            ))
            .await?;
        parse_pid(&stdout)
    }

    async fn remove_remote_file(&self, path: &str) -> Result<(), RemoteError> {
        self.ssh(&format!("rm -f {}", shell_quote(path)))
            .await
            .map(|_| ())
    }
}

/// Lists GPU-bearing instances with `gcloud compute instances list`.
#[derive(Debug, Clone)]
pub struct GcloudInventory {
    program: String,
}

impl Default for GcloudInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl GcloudInventory {
    pub fn new() -> Self {
        Self {
            program: GCLOUD.to_string(),
        }
    }
}

#[async_trait]
impl Inventory for GcloudInventory {
    async fn discover_machines(&self, project: &str) -> Result<Vec<MachineRecord>, RemoteError> {
        let args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "list".to_string(),
            format!("--project={project}"),
            "--filter=guestAccelerators.acceleratorType~nvidia".to_string(),
            "--format=value(networkInterfaces[0].accessConfigs[0].natIP,networkInterfaces[0].networkIP,name,zone)"
                .to_string(),
        ];
        let stdout = run_command(&self.program, &args).await?;
        Ok(parse_instance_list(&stdout))
    }
}

async fn run_command(program: &str, args: &[String]) -> Result<String, RemoteError> {
    tracing::trace!(program, ?args, "Running command");

    let result = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    process_output(program, args, result)
}

fn process_output(
    program: &str,
    args: &[String],
    result: Result<std::process::Output, std::io::Error>,
) -> Result<String, RemoteError> {
    match result {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        }
        Ok(output) => Err(RemoteError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
        Err(source) => Err(RemoteError::Spawn {
            program: program.to_string(),
            source,
        }),
    }
}

/// One reading per GPU, in the order nvidia-smi lists them.
pub fn parse_utilization(stdout: &str) -> Result<Vec<u8>, RemoteError> {
    let readings = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            line.parse::<u32>()
                .map(|v| v.min(100) as u8)
                .map_err(|_| RemoteError::parse("GPU utilization", stdout.trim()))
        })
        .collect::<Result<Vec<u8>, RemoteError>>()?;
    if readings.is_empty() {
        return Err(RemoteError::parse("GPU utilization", stdout.trim()));
    }
    Ok(readings)
}

pub fn parse_liveness(stdout: &str) -> Result<bool, RemoteError> {
    match stdout.lines().map(str::trim).rev().find(|l| !l.is_empty()) {
        Some(ALIVE_MARKER) => Ok(true),
        Some(GONE_MARKER) => Ok(false),
        _ => Err(RemoteError::parse("process liveness", stdout.trim())),
    }
}

/// `(pid, ppid)` pairs from `ps -eo pid=,ppid=`.
pub fn parse_process_table(stdout: &str) -> Vec<(u32, u32)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let ppid = parts.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect()
}

/// Transitive children of `root`, in breadth-first order.
pub fn descendants(table: &[(u32, u32)], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, ppid) in table {
        children.entry(ppid).or_default().push(pid);
    }

    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut frontier = VecDeque::from([root]);
    while let Some(pid) = frontier.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child) {
                found.push(child);
                frontier.push_back(child);
            }
        }
    }
    found
}

/// SM utilization per `(gpu, pid)` from `nvidia-smi pmon -c 1`, ordered by
/// GPU then pid.
///
/// Rows that do not parse contribute nothing; `-` readings count as zero.
pub fn parse_pmon(stdout: &str) -> Vec<ProcessUsage> {
    let mut usage: BTreeMap<(usize, u32), u32> = BTreeMap::new();
    for line in stdout.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        let (Ok(gpu), Ok(pid)) = (parts[0].parse::<usize>(), parts[1].parse::<u32>()) else {
            continue;
        };
        let sm = match parts[3] {
            "-" => 0,
            raw => match raw.parse::<u32>() {
                Ok(v) => v,
                Err(_) => continue,
            },
        };
        *usage.entry((gpu, pid)).or_default() += sm;
    }
    usage
        .into_iter()
        .map(|((gpu, pid), sm)| ProcessUsage {
            gpu,
            pid,
            sm: sm.min(100) as u8,
        })
        .collect()
}

pub fn parse_pid(stdout: &str) -> Result<u32, RemoteError> {
    stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| RemoteError::parse("process id", stdout.trim()))
}

/// Rows are `natIP networkIP name zone`; instances without an external
/// address only have three columns.
pub fn parse_instance_list(stdout: &str) -> Vec<MachineRecord> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let (address, name, zone) = match parts.as_slice() {
                [address, _internal, name, zone] => (*address, *name, *zone),
                [address, name, zone] => (*address, *name, *zone),
                _ => return None,
            };
            Some(MachineRecord {
                name: name.to_string(),
                address: address.to_string(),
                zone: zone.rsplit('/').next().unwrap_or(zone).to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_single_gpu() {
        assert_eq!(parse_utilization("37\n").unwrap(), vec![37]);
    }

    #[test]
    fn utilization_keeps_one_reading_per_gpu() {
        assert_eq!(parse_utilization("5\n81\n12\n").unwrap(), vec![5, 81, 12]);
    }

    #[test]
    fn utilization_rejects_garbage() {
        assert!(matches!(
            parse_utilization("NVIDIA-SMI has failed"),
            Err(RemoteError::Parse { .. })
        ));
        assert!(parse_utilization("").is_err());
    }

    #[test]
    fn utilization_is_clamped() {
        assert_eq!(parse_utilization("250").unwrap(), vec![100]);
    }

    #[test]
    fn liveness_markers() {
        assert!(parse_liveness("alive\n").unwrap());
        assert!(!parse_liveness("Warning: banner\ngone\n").unwrap());
        assert!(parse_liveness("").is_err());
    }

    #[test]
    fn process_tree_is_walked_transitively() {
        let table = parse_process_table(
            "    1     0\n  100     1\n  101   100\n  102   101\n  200     1\n  103   100\n",
        );
        let mut tree = descendants(&table, 100);
        tree.sort_unstable();
        assert_eq!(tree, vec![101, 102, 103]);
        assert!(descendants(&table, 102).is_empty());
    }

    #[test]
    fn pmon_sums_per_gpu_and_pid_and_skips_noise() {
        let stdout = "\
# gpu         pid  type    sm    mem    enc    dec    command
# Idx           #   C/G     %      %      %      %    name
    0       4242     C    55     20      -      -    python
    0       4242     C    10      5      -      -    python
    1       4242     C    30     10      -      -    python
    0       5000     C     -      -      -      -    idle
    0          -     -     -      -      -      -    -
    0       6000     C   n/a     1      -      -    weird
";
        let usage = parse_pmon(stdout);
        assert_eq!(
            usage,
            vec![
                ProcessUsage { gpu: 0, pid: 4242, sm: 65 },
                ProcessUsage { gpu: 0, pid: 5000, sm: 0 },
                ProcessUsage { gpu: 1, pid: 4242, sm: 30 },
            ]
        );
    }

    #[test]
    fn pid_from_last_line() {
        assert_eq!(parse_pid("12345\n").unwrap(), 12345);
        assert_eq!(parse_pid("motd line\n  777 \n").unwrap(), 777);
        assert!(parse_pid("not a pid").is_err());
    }

    #[test]
    fn instance_list_handles_both_layouts() {
        let stdout = "\
34.1.2.3\t10.128.0.2\tgpu-a\tus-central1-a
10.128.0.9\tgpu-b\teurope-west4-b
broken
";
        let records = parse_instance_list(stdout);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "gpu-a");
        assert_eq!(records[0].address, "34.1.2.3");
        assert_eq!(records[0].zone, "us-central1-a");
        assert_eq!(records[1].name, "gpu-b");
        assert_eq!(records[1].address, "10.128.0.9");
    }

    #[test]
    fn instance_zone_url_is_shortened() {
        let records = parse_instance_list(
            "1.2.3.4 10.0.0.1 gpu-c https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-c\n",
        );
        assert_eq!(records[0].zone, "us-east1-c");
    }

    #[test]
    fn failed_command_is_typed() {
        let err = process_output(
            "gcloud",
            &["compute".to_string()],
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing")),
        )
        .unwrap_err();
        assert!(matches!(err, RemoteError::Spawn { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let remote = GcloudRemote::new(MachineIdentity {
            name: "gpu-a".to_string(),
            address: "10.0.0.1".to_string(),
            zone: "us-central1-a".to_string(),
            project: "p".to_string(),
        })
        .with_program("/nonexistent/gcloud-binary");
        assert!(matches!(
            remote.query_utilization().await,
            Err(RemoteError::Spawn { .. })
        ));
    }
}
