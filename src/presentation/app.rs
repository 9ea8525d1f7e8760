//! Console front end
//!
//! Reads commands from a line-oriented input, forwards them to the session
//! and prints session events as they arrive.

use crate::domain::models::{CharacteristicName, CommandKind, SessionEvent};
use crate::domain::session::SessionHandle;
use crate::domain::settings::SettingsService;
use crate::error::SessionError;
use crate::infrastructure::bluetooth::protocol;
use crate::presentation::commands::{self, ConsoleCommand, HELP};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ALL_COMMANDS: [CommandKind; 8] = [
    CommandKind::StartAdapter,
    CommandKind::Scan,
    CommandKind::Connect,
    CommandKind::DiscoverServices,
    CommandKind::ReadCharacteristic,
    CommandKind::WriteCharacteristic,
    CommandKind::EnableNotifications,
    CommandKind::Disconnect,
];

/// What to print after running an intent, if anything.
///
/// Operations cut short by a teardown are not reported; the `Disconnected`
/// event already tells the user.
pub fn report(result: &Result<(), SessionError>) -> Option<String> {
    match result {
        Ok(()) => None,
        Err(SessionError::Abandoned) => {
            debug!("Operation abandoned by a teardown");
            None
        }
        Err(e) if e.is_fatal() => Some(format!(
            "Error: {}\nCheck that Bluetooth is available and enabled.",
            e
        )),
        Err(e) => Some(format!("Error: {}", e)),
    }
}

/// One-line, human readable form of a session event
pub fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::DeviceFound(handle) => format!("Found {}", handle),
        SessionEvent::Connected(handle) => format!("Connected to {}", handle),
        SessionEvent::Disconnected { reason } => format!("Disconnected ({:?})", reason),
        SessionEvent::ServicesDiscovered(names) => {
            let names: Vec<_> = names.iter().map(CharacteristicName::as_str).collect();
            format!("Services discovered: {}", names.join(", "))
        }
        SessionEvent::CharacteristicUpdated { name, value } => match name {
            CharacteristicName::Led => match protocol::decode_led(&value.bytes) {
                Some(true) => "LED is on".to_string(),
                Some(false) => "LED is off".to_string(),
                None => "LED value is empty".to_string(),
            },
            CharacteristicName::CapSense => match protocol::decode_capsense(&value.bytes) {
                Some(position) => format!("CapSense slider at {}", position),
                None => "CapSense: no touch".to_string(),
            },
        },
    }
}

pub struct ConsoleApp {
    session: SessionHandle,
    settings: Arc<Mutex<SettingsService>>,
}

impl ConsoleApp {
    pub fn new(session: SessionHandle, settings: Arc<Mutex<SettingsService>>) -> Self {
        Self { session, settings }
    }

    /// Print events and react to them until the task is aborted
    pub fn spawn_event_loop(&self) -> JoinHandle<()> {
        let mut events = self.session.subscribe();
        let app = Self::new(self.session.clone(), self.settings.clone());
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                println!("{}", describe(&event));
                app.handle_event(&event);
            }
        })
    }

    /// Remember devices and run auto-discovery
    pub fn handle_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::DeviceFound(handle) => {
                if let Err(e) = self.settings().add_known_address(handle.address()) {
                    warn!("Failed to save known address: {}", e);
                }
            }
            SessionEvent::Connected(handle) => {
                let auto_discover = {
                    let mut settings = self.settings();
                    if let Err(e) = settings.set_last_connected(handle.address()) {
                        warn!("Failed to save last connected address: {}", e);
                    }
                    settings.get().auto_discover
                };
                if auto_discover {
                    info!("Auto-discovering services");
                    let session = self.session.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session.discover_services().await {
                            error!("Auto-discovery failed: {}", e);
                        }
                    });
                }
            }
            _ => {}
        }
    }

    pub fn status(&self) -> String {
        let state = self.session.state();
        let available: Vec<_> = ALL_COMMANDS
            .iter()
            .filter(|kind| state.accepts(**kind))
            .map(ToString::to_string)
            .collect();
        let registry = self.session.registry();
        let led = match registry.led_state() {
            Some(true) => "on",
            Some(false) => "off",
            None => "unknown",
        };
        let capsense = match (registry.capsense(), registry.get(CharacteristicName::CapSense)) {
            (Some(position), _) => position.to_string(),
            (None, cached) if cached.is_stale() => "unknown".to_string(),
            (None, _) => "no touch".to_string(),
        };
        format!(
            "State: {}\nAvailable: {}\nLED: {}\nCapSense: {}",
            state,
            available.join(", "),
            led,
            capsense
        )
    }

    /// Run commands from `input` until it ends or `quit`, then close the session
    pub async fn run<R: AsyncBufRead + Unpin>(&self, input: R) -> anyhow::Result<()> {
        println!("{}", HELP);
        let mut lines = input.lines();

        while let Some(line) = lines.next_line().await? {
            let command = match commands::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    println!("{}", e);
                    continue;
                }
            };

            match command {
                ConsoleCommand::Run(intent) => {
                    if let Some(message) = report(&self.session.execute(intent).await) {
                        println!("{}", message);
                    }
                }
                ConsoleCommand::Status => println!("{}", self.status()),
                ConsoleCommand::Help => println!("{}", HELP),
                ConsoleCommand::Quit => break,
            }
        }

        self.session.close().await?;
        Ok(())
    }

    fn settings(&self) -> std::sync::MutexGuard<'_, SettingsService> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DisconnectReason, SessionState};
    use crate::domain::session::SessionStateMachine;
    use crate::error::TransportError;
    use crate::infrastructure::bluetooth::protocol::CAPSENSE_LED_SERVICE;
    use crate::infrastructure::bluetooth::simulated::{
        Operation, SimulatedPeripheral, SimulatedTransport,
    };
    use crate::infrastructure::bluetooth::TransportConfig;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn settings_at(name: &str) -> (Arc<Mutex<SettingsService>>, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "capsense_led_console_{}_{}",
            std::process::id(),
            name
        ));
        let service = SettingsService::with_path(dir.join("settings.json"));
        (Arc::new(Mutex::new(service)), dir)
    }

    fn session(board: &SimulatedPeripheral) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = SimulatedTransport::new(board.clone(), TransportConfig::default(), tx);
        SessionStateMachine::spawn(Arc::new(transport), rx, CAPSENSE_LED_SERVICE)
    }

    #[test]
    fn test_describe_events() {
        assert_eq!(
            describe(&SessionEvent::Disconnected {
                reason: DisconnectReason::LinkLost
            }),
            "Disconnected (LinkLost)"
        );
    }

    #[test]
    fn test_report_skips_abandoned_operations() {
        assert_eq!(report(&Ok(())), None);
        assert_eq!(report(&Err(SessionError::Abandoned)), None);

        let not_found = report(&Err(TransportError::NotFound.into())).unwrap();
        assert!(not_found.starts_with("Error: No peripheral"));
        assert!(!not_found.contains("Check that Bluetooth"));

        let radio_off = report(&Err(
            TransportError::AdapterUnavailable("off".into()).into()
        ))
        .unwrap();
        assert!(radio_off.ends_with("Check that Bluetooth is available and enabled."));
    }

    #[tokio::test]
    async fn test_script_switches_led_and_closes() {
        let board = SimulatedPeripheral::new();
        let (settings, dir) = settings_at("script");
        let app = ConsoleApp::new(session(&board), settings);

        let script: &[u8] = b"start\nscan\nconnect\ndiscover\nled on\nbogus\nstatus\nquit\n";
        app.run(script).await.unwrap();

        assert!(board.led_on());
        assert_eq!(board.call_count(Operation::Close), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_auto_discover_and_known_devices() {
        let board = SimulatedPeripheral::new();
        let (settings, dir) = settings_at("auto");
        settings.lock().unwrap().get_mut().auto_discover = true;
        let session = session(&board);
        let app = ConsoleApp::new(session.clone(), settings.clone());
        let mut events = session.subscribe();

        session.scan().await.unwrap();
        session.connect().await.unwrap();
        for _ in 0..2 {
            let event = events.recv().await.unwrap();
            app.handle_event(&event);
        }

        let mut state = session.watch_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == SessionState::Ready),
        )
        .await
        .unwrap()
        .unwrap();

        let saved = settings.lock().unwrap().get().clone();
        assert_eq!(saved.known_addresses, vec!["00:A0:50:C5:1E:D0".to_string()]);
        assert_eq!(
            saved.last_connected_address.as_deref(),
            Some("00:A0:50:C5:1E:D0")
        );
        assert!(app.status().contains("State: Ready"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
