//! D-Bus plumbing for `org.freedesktop.systemd1.Manager`.

use std::fmt;
use std::sync::Mutex;

use tracing::{debug, warn};
use zbus::blocking::Connection;
use zbus::zvariant::{OwnedObjectPath, Value};

use crate::error::{CgroupError, Result};

const UNIT_EXISTS: &str = "org.freedesktop.systemd1.UnitExists";
const NO_SUCH_UNIT: &str = "org.freedesktop.systemd1.NoSuchUnit";

/// One typed systemd unit property, name plus variant value.
#[derive(Debug)]
pub struct Property {
    pub name: String,
    pub value: Value<'static>,
}

impl Clone for Property {
    fn clone(&self) -> Self {
        // zvariant's `Value` exposes duplication through the fallible
        // `try_clone`, which only fails for the file-descriptor variant
        // this crate never constructs.
        Property {
            name: self.name.clone(),
            value: self
                .value
                .try_clone()
                .expect("Value::try_clone on a non-file-descriptor property value"),
        }
    }
}

/// Build a [`Property`] from anything convertible to a D-Bus value
/// (strings, booleans, 64-bit integers, integer lists, structured rule
/// lists).
pub fn prop(name: &str, value: impl Into<Value<'static>>) -> Property {
    Property {
        name: name.to_string(),
        value: value.into(),
    }
}

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[(&str, Value<'_>)],
        aux: &[(&str, Vec<(&str, Value<'_>)>)],
    ) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn set_unit_properties(
        &self,
        name: &str,
        runtime: bool,
        properties: &[(&str, Value<'_>)],
    ) -> zbus::Result<()>;

    fn reset_failed_unit(&self, name: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn job_removed(
        &self,
        id: u32,
        job: OwnedObjectPath,
        unit: String,
        result: String,
    ) -> zbus::Result<()>;
}

/// Client for the systemd manager interface on the system bus.
///
/// The bus connection is established on first use, so managers that only
/// join externally supplied paths never open one.
pub struct SystemdClient {
    conn: Mutex<Option<Connection>>,
}

impl SystemdClient {
    pub fn new() -> Self {
        SystemdClient {
            conn: Mutex::new(None),
        }
    }

    fn connection(&self) -> Result<Connection> {
        let mut guard = self.conn.lock().unwrap();
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = Connection::system().map_err(|e| CgroupError::UnitManager {
            op: "connect",
            source: e,
        })?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn proxy(&self) -> Result<SystemdManagerProxyBlocking<'static>> {
        let conn = self.connection()?;
        SystemdManagerProxyBlocking::new(&conn).map_err(|e| CgroupError::UnitManager {
            op: "proxy",
            source: e,
        })
    }

    /// Start a transient unit and block until its job completes. An
    /// already-existing unit is success: the caller is joining it.
    pub fn start_unit(&self, name: &str, properties: &[Property]) -> Result<()> {
        let proxy = self.proxy()?;
        let jobs = proxy
            .receive_job_removed()
            .map_err(|e| CgroupError::UnitManager {
                op: "subscribe to job signals",
                source: e,
            })?;

        let props = borrow_properties(properties);
        let job = match proxy.start_transient_unit(name, "replace", &props, &[]) {
            Ok(job) => job,
            Err(e) if is_dbus_error(&e, UNIT_EXISTS) => {
                debug!(unit = name, "unit already exists, joining it");
                return Ok(());
            }
            Err(e) => {
                return Err(CgroupError::UnitManager {
                    op: "start transient unit",
                    source: e,
                })
            }
        };

        let result = wait_for_job(jobs, &job)?;
        if result != "done" {
            // Leave no failed unit behind so the name can be reused.
            if let Err(e) = proxy.reset_failed_unit(name) {
                warn!(unit = name, error = %e, "reset of failed unit did not succeed");
            }
            return Err(CgroupError::UnitJob {
                unit: name.to_string(),
                result,
            });
        }
        Ok(())
    }

    /// Stop a unit and block until its job completes. A unit systemd no
    /// longer knows is already stopped.
    pub fn stop_unit(&self, name: &str) -> Result<()> {
        let proxy = self.proxy()?;
        let jobs = proxy
            .receive_job_removed()
            .map_err(|e| CgroupError::UnitManager {
                op: "subscribe to job signals",
                source: e,
            })?;

        let job = match proxy.stop_unit(name, "replace") {
            Ok(job) => job,
            Err(e) if is_dbus_error(&e, NO_SUCH_UNIT) => {
                debug!(unit = name, "unit already gone");
                return Ok(());
            }
            Err(e) => {
                return Err(CgroupError::UnitManager {
                    op: "stop unit",
                    source: e,
                })
            }
        };

        let result = wait_for_job(jobs, &job)?;
        if result != "done" {
            return Err(CgroupError::UnitJob {
                unit: name.to_string(),
                result,
            });
        }
        Ok(())
    }

    /// Apply runtime properties to a unit. Takes effect immediately, no
    /// job to await.
    pub fn set_unit_properties(&self, name: &str, properties: &[Property]) -> Result<()> {
        let proxy = self.proxy()?;
        let props = borrow_properties(properties);
        proxy
            .set_unit_properties(name, true, &props)
            .map_err(|e| CgroupError::UnitManager {
                op: "set unit properties",
                source: e,
            })
    }
}

impl Default for SystemdClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connected = self.conn.lock().unwrap().is_some();
        f.debug_struct("SystemdClient")
            .field("connected", &connected)
            .finish()
    }
}

fn borrow_properties(properties: &[Property]) -> Vec<(&str, Value<'_>)> {
    properties
        .iter()
        .map(|p| {
            (
                p.name.as_str(),
                p.value
                    .try_clone()
                    .expect("Value::try_clone on a non-file-descriptor property value"),
            )
        })
        .collect()
}

/// Block on the job-removal signal stream until `job` completes, returning
/// the job result string.
fn wait_for_job(
    jobs: impl IntoIterator<Item = JobRemoved>,
    job: &OwnedObjectPath,
) -> Result<String> {
    for signal in jobs {
        let args = signal.args().map_err(|e| CgroupError::UnitManager {
            op: "decode job signal",
            source: e,
        })?;
        if args.job() == job {
            return Ok(args.result().clone());
        }
    }
    // The signal stream only ends when the bus connection is lost.
    Err(CgroupError::UnitJob {
        unit: job.to_string(),
        result: "connection closed".to_string(),
    })
}

fn is_dbus_error(err: &zbus::Error, name: &str) -> bool {
    matches!(err, zbus::Error::MethodError(ref err_name, _, _) if err_name.as_str() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prop_builds_typed_values() {
        let p = prop("MemoryLimit", 1024u64);
        assert_eq!(p.name, "MemoryLimit");
        assert_eq!(p.value, Value::from(1024u64));

        let p = prop("Delegate", true);
        assert_eq!(p.value, Value::from(true));

        let p = prop("PIDs", vec![42u32]);
        assert_eq!(p.value, Value::from(vec![42u32]));
    }

    #[test]
    fn test_client_starts_disconnected() {
        let client = SystemdClient::new();
        assert!(format!("{:?}", client).contains("connected: false"));
    }
}
