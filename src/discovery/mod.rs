//! Service discovery.
//!
//! Publishers announce themselves under a service type derived from the
//! message type they carry; subscribers browse that type and match on the
//! service name. The directory is an in-process registry whose browse
//! results arrive as an event stream of resolved/lost notifications, the
//! same contract a DNS-SD backend would provide, so one can be substituted
//! behind this interface without touching subscriber code.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tokio::sync::watch;

/// Connection details published for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub name: String,
    pub service_type: String,
    pub host: String,
    pub port: u16,
    /// Free-form TXT entries: `transport`, `ip`, `HeartBeatPort`, ...
    pub txt: HashMap<String, String>,
}

impl ResolvedService {
    pub fn txt_entry(&self, key: &str) -> Option<&str> {
        self.txt.get(key).map(String::as_str)
    }
}

/// The service type a publisher registers for a given message type name.
pub fn publisher_type(type_name: &str) -> String {
    format!("_{}._radial-pub", type_name)
}

/// The type a subscriber browses to find publishers of a message type. The
/// twin of [`publisher_type`].
pub fn subscriber_twin_type(type_name: &str) -> String {
    publisher_type(type_name)
}

type ServiceKey = (String, String); // (service_type, name)

struct Directory {
    entries: HashMap<ServiceKey, ResolvedService>,
    watchers: HashMap<ServiceKey, watch::Sender<Option<ResolvedService>>>,
}

static DIRECTORY: OnceLock<Mutex<Directory>> = OnceLock::new();

fn directory() -> &'static Mutex<Directory> {
    DIRECTORY.get_or_init(|| {
        Mutex::new(Directory {
            entries: HashMap::new(),
            watchers: HashMap::new(),
        })
    })
}

/// Registration guard. Dropping it withdraws the service and notifies
/// browsers with a lost event.
pub struct Registration {
    key: ServiceKey,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut dir = directory().lock().expect("directory mutex");
        dir.entries.remove(&self.key);
        if let Some(tx) = dir.watchers.get(&self.key) {
            let _ = tx.send(None);
        }
        tracing::info!(name = %self.key.1, service_type = %self.key.0, "service withdrawn");
    }
}

/// Publish a service. Browsers watching for its type and name see a resolved
/// event immediately.
pub fn register(service: ResolvedService) -> Registration {
    let key = (service.service_type.clone(), service.name.clone());
    tracing::info!(
        name = %service.name,
        service_type = %service.service_type,
        host = %service.host,
        port = service.port,
        "service published"
    );
    let mut dir = directory().lock().expect("directory mutex");
    if let Some(tx) = dir.watchers.get(&key) {
        let _ = tx.send(Some(service.clone()));
    }
    dir.entries.insert(key.clone(), service);
    Registration { key }
}

/// Browse for a service by type and name. The receiver holds the current
/// resolution (None while the service is absent) and changes as the service
/// comes and goes.
pub fn browse(service_type: &str, name: &str) -> watch::Receiver<Option<ResolvedService>> {
    let key = (service_type.to_string(), name.to_string());
    let mut dir = directory().lock().expect("directory mutex");
    let current = dir.entries.get(&key).cloned();
    let tx = dir
        .watchers
        .entry(key)
        .or_insert_with(|| watch::channel(None).0);
    if current.is_some() {
        let _ = tx.send(current);
    }
    tx.subscribe()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, port: u16) -> ResolvedService {
        ResolvedService {
            name: name.to_string(),
            service_type: publisher_type("Video"),
            host: "127.0.0.1".to_string(),
            port,
            txt: HashMap::from([("transport".to_string(), "tcp".to_string())]),
        }
    }

    #[tokio::test]
    async fn browse_sees_existing_and_future_registrations() {
        let registration = register(service("existing-pub", 4000));
        let rx = browse(&publisher_type("Video"), "existing-pub");
        assert_eq!(rx.borrow().as_ref().unwrap().port, 4000);
        drop(registration);

        let mut rx = browse(&publisher_type("Video"), "late-pub");
        assert!(rx.borrow().is_none());

        let registration = register(service("late-pub", 4001));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().port, 4001);
        drop(registration);
    }

    #[tokio::test]
    async fn dropping_the_registration_emits_lost() {
        let registration = register(service("flapper", 4002));
        let mut rx = browse(&publisher_type("Video"), "flapper");
        assert!(rx.borrow().is_some());

        drop(registration);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn twin_types_match() {
        assert_eq!(publisher_type("Video"), subscriber_twin_type("Video"));
    }
}
