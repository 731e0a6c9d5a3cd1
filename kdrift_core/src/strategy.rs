use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DURATION_SECS: u64 = 3600;
const DEFAULT_PARALLELISM: usize = 4;

/// Errors for strategy requests. Reported synchronously, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),
    #[error("missing target: {0}")]
    MissingTarget(String),
    #[error("unknown protocol family '{0}'")]
    UnknownProtocol(String),
}

/// The kernel attack surface a campaign aims at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FuzzingTarget {
    Syscall,
    Ioctl,
    Network,
    Filesystem,
    DeviceDriver,
    Custom,
}

impl FuzzingTarget {
    pub const ALL: [FuzzingTarget; 6] = [
        FuzzingTarget::Syscall,
        FuzzingTarget::Ioctl,
        FuzzingTarget::Network,
        FuzzingTarget::Filesystem,
        FuzzingTarget::DeviceDriver,
        FuzzingTarget::Custom,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FuzzingTarget::Syscall => "syscall",
            FuzzingTarget::Ioctl => "ioctl",
            FuzzingTarget::Network => "network",
            FuzzingTarget::Filesystem => "filesystem",
            FuzzingTarget::DeviceDriver => "device-driver",
            FuzzingTarget::Custom => "custom",
        }
    }
}

impl fmt::Display for FuzzingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FuzzingTarget {
    type Err = StrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        if wanted == "driver" {
            return Ok(FuzzingTarget::DeviceDriver);
        }
        FuzzingTarget::ALL
            .into_iter()
            .find(|target| target.name() == wanted)
            .ok_or_else(|| StrategyError::InvalidConstraint(format!("unknown target kind '{s}'")))
    }
}

/// Caller-supplied knobs for strategy generation. Unknown keys are rejected.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StrategyConstraints {
    #[serde(default)]
    pub syscall_groups: Vec<String>,
    #[serde(default)]
    pub syscalls: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub coverage: Option<bool>,
    #[serde(default)]
    pub comparisons: Option<bool>,
    #[serde(default)]
    pub fault_injection: Option<bool>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub parallelism: Option<usize>,
}

impl StrategyConstraints {
    pub fn from_json(raw: &str) -> Result<Self, StrategyError> {
        serde_json::from_str(raw).map_err(|e| StrategyError::InvalidConstraint(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, StrategyError> {
        serde_json::from_value(value).map_err(|e| StrategyError::InvalidConstraint(e.to_string()))
    }
}

/// An immutable campaign configuration produced by [`StrategyGenerator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzingStrategy {
    name: String,
    target: FuzzingTarget,
    allow_list: Vec<String>,
    targets: Vec<String>,
    coverage: bool,
    comparisons: bool,
    fault_injection: bool,
    max_duration_secs: u64,
    parallelism: usize,
}

impl FuzzingStrategy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> FuzzingTarget {
        self.target
    }

    /// Syscalls (with syzkaller-style `$` variants) the engine may generate.
    pub fn allow_list(&self) -> &[String] {
        &self.allow_list
    }

    /// Device paths, protocol names, filesystem types or driver names.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn coverage(&self) -> bool {
        self.coverage
    }

    pub fn comparisons(&self) -> bool {
        self.comparisons
    }

    pub fn fault_injection(&self) -> bool {
        self.fault_injection
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSpec {
    pub family: String,
    pub syscalls: Vec<String>,
}

/// Target metadata: syscall buckets, known devices, protocols and filesystems.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    syscall_groups: BTreeMap<String, Vec<String>>,
    devices: BTreeMap<String, String>,
    protocols: BTreeMap<String, ProtocolSpec>,
    filesystems: Vec<String>,
}

const SYSCALL_GROUPS: &[(&str, &[&str])] = &[
    (
        "filesystem",
        &[
            "open", "openat", "read", "write", "close", "lseek", "stat", "fstat", "mkdir",
            "rmdir", "unlink", "rename", "fsync", "ftruncate", "getdents64", "mount", "umount2",
        ],
    ),
    (
        "network",
        &[
            "socket", "bind", "connect", "listen", "accept4", "sendto", "recvfrom", "sendmsg",
            "recvmsg", "setsockopt", "getsockopt", "shutdown",
        ],
    ),
    (
        "process",
        &[
            "clone", "execve", "exit", "wait4", "kill", "prctl", "setns", "unshare", "ptrace",
        ],
    ),
    (
        "memory",
        &[
            "mmap", "munmap", "mprotect", "madvise", "mremap", "brk", "mlock", "munlock",
            "userfaultfd",
        ],
    ),
    (
        "ipc",
        &[
            "pipe2", "msgget", "msgsnd", "msgrcv", "semget", "semop", "shmget", "shmat", "shmdt",
            "eventfd2", "futex",
        ],
    ),
];

const DEVICES: &[(&str, &str)] = &[
    ("/dev/kvm", "KVM"),
    ("/dev/net/tun", "TUNSET"),
    ("/dev/loop0", "LOOP"),
    ("/dev/fuse", "FUSE"),
    ("/dev/dri/card0", "DRM"),
    ("/dev/snd/controlC0", "SNDRV_CTL"),
    ("/dev/input/event0", "EVIOC"),
    ("/dev/vhost-net", "VHOST"),
    ("/dev/uinput", "UI"),
];

const PROTOCOLS: &[(&str, &str, &[&str])] = &[
    (
        "tcp",
        "AF_INET",
        &["socket$inet_tcp", "connect$inet", "sendto$inet", "setsockopt$inet_tcp_int"],
    ),
    (
        "udp",
        "AF_INET",
        &["socket$inet_udp", "connect$inet", "sendto$inet", "setsockopt$inet_udp_int"],
    ),
    ("icmp", "AF_INET", &["socket$inet_icmp", "sendto$inet"]),
    ("icmpv6", "AF_INET6", &["socket$inet6_icmp", "sendto$inet6"]),
    ("sctp", "AF_INET", &["socket$inet_sctp", "connect$inet", "setsockopt$inet_sctp_SCTP_EVENTS"]),
    ("dccp", "AF_INET", &["socket$inet_dccp", "connect$inet", "setsockopt$inet_dccp_int"]),
    ("raw", "AF_INET", &["socket$inet_raw", "sendto$inet"]),
    (
        "packet",
        "AF_PACKET",
        &["socket$packet", "bind$packet", "sendto$packet", "setsockopt$packet_int"],
    ),
    ("netlink", "AF_NETLINK", &["socket$nl_route", "sendmsg$nl_route", "bind$netlink"]),
    ("unix", "AF_UNIX", &["socket$unix", "bind$unix", "connect$unix", "sendmsg$unix"]),
    ("can", "AF_CAN", &["socket$can_raw", "bind$can_raw", "sendmsg$can_raw"]),
    ("tipc", "AF_TIPC", &["socket$tipc", "bind$tipc", "sendmsg$tipc"]),
    ("vsock", "AF_VSOCK", &["socket$vsock_stream", "connect$vsock_stream", "sendmsg$vsock"]),
    ("l2tp", "AF_PPPOX", &["socket$pppl2tp", "connect$pppl2tp"]),
];

const FILESYSTEMS: &[&str] = &[
    "ext4", "btrfs", "xfs", "f2fs", "vfat", "ntfs3", "jfs", "hfsplus", "squashfs", "iso9660",
    "tmpfs",
];

impl Default for TargetRegistry {
    fn default() -> Self {
        Self {
            syscall_groups: SYSCALL_GROUPS
                .iter()
                .map(|(name, calls)| (name.to_string(), to_strings(calls)))
                .collect(),
            devices: DEVICES
                .iter()
                .map(|(path, family)| (path.to_string(), family.to_string()))
                .collect(),
            protocols: PROTOCOLS
                .iter()
                .map(|(name, family, calls)| {
                    (
                        name.to_string(),
                        ProtocolSpec {
                            family: family.to_string(),
                            syscalls: to_strings(calls),
                        },
                    )
                })
                .collect(),
            filesystems: to_strings(FILESYSTEMS),
        }
    }
}

impl TargetRegistry {
    pub fn with_syscall_group(mut self, name: &str, syscalls: &[&str]) -> Self {
        self.syscall_groups
            .insert(name.to_ascii_lowercase(), to_strings(syscalls));
        self
    }

    pub fn with_device(mut self, path: &str, ioctl_family: &str) -> Self {
        self.devices.insert(path.to_string(), ioctl_family.to_string());
        self
    }

    pub fn with_protocol(mut self, name: &str, family: &str, syscalls: &[&str]) -> Self {
        self.protocols.insert(
            name.to_ascii_lowercase(),
            ProtocolSpec {
                family: family.to_string(),
                syscalls: to_strings(syscalls),
            },
        );
        self
    }

    pub fn with_filesystem(mut self, name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if !self.filesystems.contains(&name) {
            self.filesystems.push(name);
        }
        self
    }

    pub fn syscall_group(&self, name: &str) -> Option<&[String]> {
        self.syscall_groups.get(name).map(Vec::as_slice)
    }

    pub fn syscall_group_names(&self) -> impl Iterator<Item = &str> {
        self.syscall_groups.keys().map(String::as_str)
    }

    pub fn ioctl_family(&self, device: &str) -> Option<&str> {
        self.devices.get(device).map(String::as_str)
    }

    pub fn protocol(&self, name: &str) -> Option<&ProtocolSpec> {
        self.protocols.get(name)
    }

    pub fn knows_filesystem(&self, name: &str) -> bool {
        self.filesystems.iter().any(|fs| fs == name)
    }
}

/// Builds [`FuzzingStrategy`] values. Stateless apart from its registry.
#[derive(Debug, Clone, Default)]
pub struct StrategyGenerator {
    registry: TargetRegistry,
}

impl StrategyGenerator {
    pub fn new(registry: TargetRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Parses raw JSON constraints, then generates.
    pub fn generate_json(
        &self,
        target: FuzzingTarget,
        raw_constraints: &str,
    ) -> Result<FuzzingStrategy, StrategyError> {
        let constraints = StrategyConstraints::from_json(raw_constraints)?;
        self.generate(target, &constraints)
    }

    pub fn generate(
        &self,
        target: FuzzingTarget,
        constraints: &StrategyConstraints,
    ) -> Result<FuzzingStrategy, StrategyError> {
        let (name, mut allow_list, targets) = match target {
            FuzzingTarget::Syscall => self.syscall_surface(constraints)?,
            FuzzingTarget::Ioctl => self.ioctl_surface(constraints)?,
            FuzzingTarget::Network => self.network_surface(constraints)?,
            FuzzingTarget::Filesystem => self.filesystem_surface(constraints)?,
            FuzzingTarget::DeviceDriver => self.driver_surface(constraints)?,
            FuzzingTarget::Custom => custom_surface(constraints)?,
        };
        if target != FuzzingTarget::Custom {
            allow_list.extend(constraints.syscalls.iter().map(|s| s.trim().to_string()));
        }
        dedup_preserving_order(&mut allow_list);

        let max_duration_secs = constraints.duration_secs.unwrap_or(DEFAULT_DURATION_SECS);
        if max_duration_secs == 0 {
            return Err(StrategyError::InvalidConstraint(
                "duration-secs must be greater than zero".to_string(),
            ));
        }
        let parallelism = constraints.parallelism.unwrap_or(DEFAULT_PARALLELISM);
        if parallelism == 0 {
            return Err(StrategyError::InvalidConstraint(
                "parallelism must be greater than zero".to_string(),
            ));
        }

        let default_comparisons = matches!(
            target,
            FuzzingTarget::Syscall | FuzzingTarget::Ioctl | FuzzingTarget::DeviceDriver
        );
        let default_fault_injection = target == FuzzingTarget::Filesystem;

        Ok(FuzzingStrategy {
            name,
            target,
            allow_list,
            targets,
            coverage: constraints.coverage.unwrap_or(true),
            comparisons: constraints.comparisons.unwrap_or(default_comparisons),
            fault_injection: constraints.fault_injection.unwrap_or(default_fault_injection),
            max_duration_secs,
            parallelism,
        })
    }

    fn syscall_surface(&self, c: &StrategyConstraints) -> Result<Surface, StrategyError> {
        if c.syscall_groups.is_empty() {
            let known: Vec<&str> = self.registry.syscall_group_names().collect();
            return Err(StrategyError::InvalidConstraint(format!(
                "select at least one syscall group ({})",
                known.join(", ")
            )));
        }
        let mut allow_list = Vec::new();
        let mut groups = Vec::new();
        for group in &c.syscall_groups {
            let key = group.trim().to_ascii_lowercase();
            let calls = self.registry.syscall_group(&key).ok_or_else(|| {
                StrategyError::InvalidConstraint(format!("unknown syscall group '{group}'"))
            })?;
            allow_list.extend_from_slice(calls);
            groups.push(key);
        }
        dedup_preserving_order(&mut groups);
        let name = format!("syscall-{}", groups.join("+"));
        Ok((name, allow_list, groups))
    }

    fn ioctl_surface(&self, c: &StrategyConstraints) -> Result<Surface, StrategyError> {
        if c.devices.is_empty() {
            return Err(StrategyError::MissingTarget(
                "ioctl fuzzing needs at least one device path".to_string(),
            ));
        }
        let devices = validate_devices(&c.devices)?;
        let mut allow_list = to_strings(&["openat", "ioctl", "close", "mmap"]);
        for device in &devices {
            if let Some(family) = self.registry.ioctl_family(device) {
                allow_list.push(format!("ioctl${family}"));
            }
        }
        let name = format!("ioctl-{}", device_slug(&devices[0]));
        Ok((name, allow_list, devices))
    }

    fn network_surface(&self, c: &StrategyConstraints) -> Result<Surface, StrategyError> {
        let Some(protocol) = c.protocol.as_deref() else {
            return Err(StrategyError::MissingTarget(
                "network fuzzing needs a protocol family".to_string(),
            ));
        };
        let key = protocol.trim().to_ascii_lowercase();
        let spec = self
            .registry
            .protocol(&key)
            .ok_or_else(|| StrategyError::UnknownProtocol(protocol.to_string()))?;
        let mut allow_list = spec.syscalls.clone();
        allow_list.extend(to_strings(&["close", "recvmsg", "shutdown"]));
        Ok((format!("network-{key}"), allow_list, vec![key, spec.family.clone()]))
    }

    fn filesystem_surface(&self, c: &StrategyConstraints) -> Result<Surface, StrategyError> {
        let Some(fs) = c.filesystem.as_deref() else {
            return Err(StrategyError::MissingTarget(
                "filesystem fuzzing needs a filesystem type".to_string(),
            ));
        };
        let key = fs.trim().to_ascii_lowercase();
        if !self.registry.knows_filesystem(&key) {
            return Err(StrategyError::InvalidConstraint(format!(
                "unknown filesystem type '{fs}'"
            )));
        }
        let mut allow_list = vec![format!("syz_mount_image${key}")];
        if let Some(calls) = self.registry.syscall_group("filesystem") {
            allow_list.extend_from_slice(calls);
        }
        Ok((format!("filesystem-{key}"), allow_list, vec![key]))
    }

    fn driver_surface(&self, c: &StrategyConstraints) -> Result<Surface, StrategyError> {
        let Some(driver) = c.driver.as_deref().map(str::trim).filter(|d| !d.is_empty()) else {
            return Err(StrategyError::MissingTarget(
                "device-driver fuzzing needs a driver name".to_string(),
            ));
        };
        let devices = validate_devices(&c.devices)?;
        let mut allow_list =
            to_strings(&["openat", "ioctl", "read", "write", "mmap", "poll", "close"]);
        for device in &devices {
            if let Some(family) = self.registry.ioctl_family(device) {
                allow_list.push(format!("ioctl${family}"));
            }
        }
        let mut targets = vec![driver.to_string()];
        targets.extend(devices);
        Ok((format!("driver-{driver}"), allow_list, targets))
    }
}

/// `(name, allow_list, targets)` of a generated surface.
type Surface = (String, Vec<String>, Vec<String>);

fn custom_surface(c: &StrategyConstraints) -> Result<Surface, StrategyError> {
    let syscalls: Vec<String> = c
        .syscalls
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if syscalls.is_empty() {
        return Err(StrategyError::MissingTarget(
            "custom fuzzing needs an explicit syscall list".to_string(),
        ));
    }
    Ok(("custom".to_string(), syscalls, Vec::new()))
}

fn validate_devices(devices: &[String]) -> Result<Vec<String>, StrategyError> {
    let mut validated = Vec::with_capacity(devices.len());
    for device in devices {
        let path = device.trim();
        if !path.starts_with("/dev/") || path.len() <= "/dev/".len() {
            return Err(StrategyError::InvalidConstraint(format!(
                "device path '{device}' is not under /dev/"
            )));
        }
        validated.push(path.to_string());
    }
    dedup_preserving_order(&mut validated);
    Ok(validated)
}

fn device_slug(path: &str) -> String {
    path.trim_start_matches("/dev/").replace('/', "-")
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn dedup_preserving_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraints(json: &str) -> StrategyConstraints {
        StrategyConstraints::from_json(json).unwrap()
    }

    fn valid_constraints_for(target: FuzzingTarget) -> StrategyConstraints {
        match target {
            FuzzingTarget::Syscall => constraints(r#"{"syscall-groups": ["filesystem"]}"#),
            FuzzingTarget::Ioctl => constraints(r#"{"devices": ["/dev/kvm"]}"#),
            FuzzingTarget::Network => constraints(r#"{"protocol": "tcp"}"#),
            FuzzingTarget::Filesystem => constraints(r#"{"filesystem": "ext4"}"#),
            FuzzingTarget::DeviceDriver => constraints(r#"{"driver": "vivid"}"#),
            FuzzingTarget::Custom => constraints(r#"{"syscalls": ["bpf", "perf_event_open"]}"#),
        }
    }

    #[test]
    fn generated_strategy_keeps_requested_target_kind() {
        let generator = StrategyGenerator::default();
        for target in FuzzingTarget::ALL {
            let strategy = generator
                .generate(target, &valid_constraints_for(target))
                .unwrap_or_else(|e| panic!("{target} should generate: {e}"));
            assert_eq!(strategy.target(), target);
            assert!(!strategy.allow_list().is_empty());
            assert!(strategy.coverage());
        }
    }

    #[test]
    fn unknown_constraint_fields_are_invalid() {
        let generator = StrategyGenerator::default();
        let err = generator
            .generate_json(FuzzingTarget::Syscall, r#"{"syscall-groups": ["ipc"], "turbo": true}"#)
            .unwrap_err();
        assert!(matches!(err, StrategyError::InvalidConstraint(_)));
        assert!(matches!(
            StrategyConstraints::from_json("not json"),
            Err(StrategyError::InvalidConstraint(_))
        ));
    }

    #[test]
    fn syscall_groups_merge_buckets() {
        let generator = StrategyGenerator::default();
        let strategy = generator
            .generate(
                FuzzingTarget::Syscall,
                &constraints(
                    r#"{"syscall-groups": ["memory", "IPC"], "syscalls": ["mmap", "bpf"]}"#,
                ),
            )
            .unwrap();
        assert_eq!(strategy.name(), "syscall-memory+ipc");
        assert!(strategy.allow_list().contains(&"futex".to_string()));
        assert!(strategy.allow_list().contains(&"bpf".to_string()));
        let mmaps = strategy.allow_list().iter().filter(|s| *s == "mmap").count();
        assert_eq!(mmaps, 1);
        assert!(strategy.comparisons());
        assert!(!strategy.fault_injection());
    }

    #[test]
    fn syscall_target_requires_known_groups() {
        let generator = StrategyGenerator::default();
        assert!(matches!(
            generator.generate(FuzzingTarget::Syscall, &StrategyConstraints::default()),
            Err(StrategyError::InvalidConstraint(_))
        ));
        assert!(matches!(
            generator.generate(
                FuzzingTarget::Syscall,
                &constraints(r#"{"syscall-groups": ["graphics"]}"#),
            ),
            Err(StrategyError::InvalidConstraint(_))
        ));
    }

    #[test]
    fn ioctl_requires_a_device_path() {
        let generator = StrategyGenerator::default();
        assert!(matches!(
            generator.generate(FuzzingTarget::Ioctl, &StrategyConstraints::default()),
            Err(StrategyError::MissingTarget(_))
        ));
        assert!(matches!(
            generator.generate(FuzzingTarget::Ioctl, &constraints(r#"{"devices": ["kvm"]}"#)),
            Err(StrategyError::InvalidConstraint(_))
        ));
        let strategy = generator
            .generate(
                FuzzingTarget::Ioctl,
                &constraints(r#"{"devices": ["/dev/kvm", "/dev/custom0"]}"#),
            )
            .unwrap();
        assert_eq!(strategy.name(), "ioctl-kvm");
        assert_eq!(strategy.targets(), &["/dev/kvm", "/dev/custom0"]);
        assert!(strategy.allow_list().contains(&"ioctl$KVM".to_string()));
    }

    #[test]
    fn network_requires_a_registered_protocol() {
        let generator = StrategyGenerator::default();
        assert!(matches!(
            generator.generate(FuzzingTarget::Network, &constraints(r#"{"protocol": "quic"}"#)),
            Err(StrategyError::UnknownProtocol(p)) if p == "quic"
        ));
        assert!(matches!(
            generator.generate(FuzzingTarget::Network, &StrategyConstraints::default()),
            Err(StrategyError::MissingTarget(_))
        ));
        let strategy = generator
            .generate(FuzzingTarget::Network, &constraints(r#"{"protocol": "UDP"}"#))
            .unwrap();
        assert_eq!(strategy.targets(), &["udp", "AF_INET"]);
        assert!(strategy.allow_list().contains(&"socket$inet_udp".to_string()));

        let custom = StrategyGenerator::new(TargetRegistry::default().with_protocol(
            "quic",
            "AF_INET",
            &["socket$inet_udp"],
        ));
        assert!(custom
            .generate(FuzzingTarget::Network, &constraints(r#"{"protocol": "quic"}"#))
            .is_ok());
    }

    #[test]
    fn filesystem_defaults_enable_fault_injection() {
        let generator = StrategyGenerator::default();
        let strategy = generator
            .generate(FuzzingTarget::Filesystem, &constraints(r#"{"filesystem": "btrfs"}"#))
            .unwrap();
        assert!(strategy.fault_injection());
        assert!(!strategy.comparisons());
        assert_eq!(strategy.allow_list()[0], "syz_mount_image$btrfs");
        assert!(matches!(
            generator.generate(FuzzingTarget::Filesystem, &constraints(r#"{"filesystem": "zfs"}"#)),
            Err(StrategyError::InvalidConstraint(_))
        ));
        assert!(matches!(
            generator.generate(FuzzingTarget::Filesystem, &StrategyConstraints::default()),
            Err(StrategyError::MissingTarget(_))
        ));
    }

    #[test]
    fn custom_needs_explicit_syscalls() {
        let generator = StrategyGenerator::default();
        assert!(matches!(
            generator.generate(FuzzingTarget::Custom, &constraints(r#"{"syscalls": [" "]}"#)),
            Err(StrategyError::MissingTarget(_))
        ));
        assert!(matches!(
            generator.generate(FuzzingTarget::DeviceDriver, &StrategyConstraints::default()),
            Err(StrategyError::MissingTarget(_))
        ));
    }

    #[test]
    fn duration_and_parallelism_are_validated() {
        let generator = StrategyGenerator::default();
        let strategy = generator
            .generate(
                FuzzingTarget::Custom,
                &constraints(
                    r#"{"syscalls": ["bpf"], "duration-secs": 90,
                        "parallelism": 2, "coverage": false}"#,
                ),
            )
            .unwrap();
        assert_eq!(strategy.max_duration(), Duration::from_secs(90));
        assert_eq!(strategy.parallelism(), 2);
        assert!(!strategy.coverage());
        assert!(matches!(
            generator.generate(
                FuzzingTarget::Custom,
                &constraints(r#"{"syscalls": ["bpf"], "duration-secs": 0}"#),
            ),
            Err(StrategyError::InvalidConstraint(_))
        ));
        assert!(matches!(
            generator.generate(
                FuzzingTarget::Custom,
                &constraints(r#"{"syscalls": ["bpf"], "parallelism": 0}"#),
            ),
            Err(StrategyError::InvalidConstraint(_))
        ));
    }

    #[test]
    fn generation_is_deterministic_and_serializes() {
        let generator = StrategyGenerator::default();
        let c = valid_constraints_for(FuzzingTarget::Ioctl);
        let a = generator.generate(FuzzingTarget::Ioctl, &c).unwrap();
        let b = generator.generate(FuzzingTarget::Ioctl, &c).unwrap();
        assert_eq!(a, b);
        let json = serde_json::to_string(&a).unwrap();
        let back: FuzzingStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert!(json.contains("\"target\":\"ioctl\""));
    }

    #[test]
    fn target_kind_parses_from_cli_names() {
        assert_eq!("device-driver".parse::<FuzzingTarget>(), Ok(FuzzingTarget::DeviceDriver));
        assert_eq!("driver".parse::<FuzzingTarget>(), Ok(FuzzingTarget::DeviceDriver));
        assert_eq!("Syscall".parse::<FuzzingTarget>(), Ok(FuzzingTarget::Syscall));
        assert!("usb".parse::<FuzzingTarget>().is_err());
    }
}
