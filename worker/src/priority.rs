//! Prioridad dinámica de las tareas pendientes.
//!
//! La clave ordena de menor a mayor: `(-priority, fs_scale, -duration, id)`.
//! `fs_scale` es el promedio, pesado por tamaño, de un multiplicador por tipo
//! de filesystem de los `io_paths` de la tarea: lo que está en disco rápido
//! (o en pseudo-filesystems) sale primero, lo que está en red después.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use common::task::{Task, TaskId};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub device: String,
    pub point: PathBuf,
    pub fstype: String,
}

/// `\040` y compañía de /proc/self/mounts.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Formato de /proc/self/mounts: `device point fstype opciones dump pass`.
pub fn parse_proc_mounts(text: &str) -> Vec<Mount> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let point = fields.next()?;
            let fstype = fields.next()?;
            Some(Mount {
                device: unescape_octal(device),
                point: PathBuf::from(unescape_octal(point)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Salida de `mount`: `dev on /punto type fstype (opts)` en Linux y
/// `dev on /punto (fstype, opts)` en BSD/macOS.
pub fn parse_mount_output(text: &str) -> Vec<Mount> {
    text.lines()
        .filter_map(|line| {
            let (device, rest) = line.split_once(" on ")?;
            if let Some((point, rest)) = rest.split_once(" type ") {
                let fstype = rest.split_whitespace().next()?;
                return Some(Mount {
                    device: device.to_string(),
                    point: PathBuf::from(point),
                    fstype: fstype.to_string(),
                });
            }
            let (point, rest) = rest.rsplit_once(" (")?;
            let fstype = rest.split(|c| c == ',' || c == ')').next()?.trim();
            Some(Mount {
                device: device.to_string(),
                point: PathBuf::from(point),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub fn from_mounts(mounts: Vec<Mount>) -> Self {
        Self { mounts }
    }

    /// Lee /proc/self/mounts; si no existe, parsea la salida de `mount`.
    pub fn load() -> Self {
        if let Ok(text) = fs::read_to_string("/proc/self/mounts") {
            return Self::from_mounts(parse_proc_mounts(&text));
        }
        match Command::new("mount").output() {
            Ok(out) => Self::from_mounts(parse_mount_output(&String::from_utf8_lossy(&out.stdout))),
            Err(e) => {
                debug!("no se pudo leer la tabla de mounts: {}", e);
                Self::default()
            }
        }
    }

    /// El mount con el punto de montaje más largo que contiene `path`.
    pub fn mount_for(&self, path: &Path) -> Option<&Mount> {
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.mounts
            .iter()
            .filter(|m| path.starts_with(&m.point))
            .max_by_key(|m| m.point.as_os_str().len())
    }
}

/// Multiplicador por tipo de filesystem.
pub fn fs_multiplier(fstype: &str) -> f64 {
    match fstype {
        "devfs" | "devtmpfs" | "proc" | "sysfs" | "tmpfs" => 0.1,
        "nfs" | "nfs4" | "cifs" | "smbfs" => 0.75,
        _ => 1.0,
    }
}

/// Promedio pesado por tamaño; 1.0 si no hay paths existentes.
pub fn fs_scale(io_paths: &[String], mounts: &MountTable) -> f64 {
    let mut weighted = 0.0;
    let mut weight = 0.0;
    for path in io_paths {
        let Ok(meta) = fs::metadata(path) else {
            continue;
        };
        let size = meta.len() as f64;
        let fstype = mounts
            .mount_for(Path::new(path))
            .map(|m| m.fstype.as_str())
            .unwrap_or("");
        trace!("mount de {:?} es {:?}", path, fstype);
        weighted += fs_multiplier(fstype) * size;
        weight += size;
    }
    if weight > 0.0 {
        weighted / weight
    } else {
        1.0
    }
}

/// Menor = antes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityKey {
    pub neg_priority: i64,
    pub fs_scale: f64,
    pub neg_duration: i64,
    pub id: TaskId,
}

impl Eq for PriorityKey {}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.neg_priority
            .cmp(&other.neg_priority)
            .then_with(|| self.fs_scale.total_cmp(&other.fs_scale))
            .then_with(|| self.neg_duration.cmp(&other.neg_duration))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn calculate_priority(task: &Task, mounts: &MountTable) -> PriorityKey {
    let scale = fs_scale(&task.io_paths, mounts);
    debug!("escala de filesystem para {} es {:.3}", task.id, scale);
    let duration = task.duration.unwrap_or(0).min(i64::MAX as u64) as i64;
    PriorityKey {
        neg_priority: -task.priority,
        fs_scale: scale,
        neg_duration: -duration,
        id: task.id,
    }
}
