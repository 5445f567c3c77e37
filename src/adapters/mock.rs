//! Mock transport for testing and simulation
//!
//! [`MockAdapter`] records every command it receives and answers queries through a
//! pluggable responder. A cloneable [`MockHandle`] shares the recorded state so tests
//! can keep inspecting the conversation after the adapter has been moved into a
//! session. Faults (timeouts, undecodable bytes, dropped links, garbage text) are
//! injected per command prefix and occurrence.

use super::TransportChannel;
use crate::error::{AppResult, DaqError};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Produces the reply for a query. Also sees every write, with the reply ignored.
pub type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Callback run for every command after it is recorded.
pub type CommandHook = Box<dyn FnMut(&str) + Send>;

/// Direction of a recorded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Sent with `write`.
    Write,
    /// Sent with `query`.
    Query,
}

/// One recorded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Command text without terminator.
    pub command: String,
    /// Whether the command was written or queried.
    pub kind: CallKind,
}

/// Failure to inject in place of a normal reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Round trip exceeds the transport timeout.
    Timeout,
    /// Reply bytes cannot be decoded.
    InvalidBytes,
    /// Link dropped.
    Disconnect,
    /// Reply is the given text instead of the responder's.
    Reply(String),
}

struct FaultRule {
    prefix: String,
    occurrence: usize,
    seen: usize,
    fault: Fault,
}

struct MockState {
    calls: Vec<MockCall>,
    responder: Responder,
    faults: Vec<FaultRule>,
    hooks: Vec<CommandHook>,
}

impl MockState {
    fn take_fault(&mut self, command: &str) -> Option<Fault> {
        let mut hit = None;
        for rule in self.faults.iter_mut().filter(|r| command.starts_with(&r.prefix)) {
            rule.seen += 1;
            if rule.seen == rule.occurrence && hit.is_none() {
                hit = Some(rule.fault.clone());
            }
        }
        hit
    }
}

/// Shared view of a [`MockAdapter`]'s recorded state.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Every command in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Every command text in order, writes and queries interleaved.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().calls.iter().map(|c| c.command.clone()).collect()
    }

    /// Commands sent with `write`.
    pub fn writes(&self) -> Vec<String> {
        self.filtered(CallKind::Write)
    }

    /// Commands sent with `query`.
    pub fn queries(&self) -> Vec<String> {
        self.filtered(CallKind::Query)
    }

    /// Number of `write` calls.
    pub fn write_count(&self) -> usize {
        self.writes().len()
    }

    /// How many times `command` was sent, by exact match.
    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.command == command)
            .count()
    }

    /// Forget all recorded commands.
    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }

    /// Inject `fault` on the `occurrence`-th (1-based) query starting with `prefix`.
    pub fn inject(&self, prefix: impl Into<String>, occurrence: usize, fault: Fault) {
        self.state.lock().faults.push(FaultRule {
            prefix: prefix.into(),
            occurrence,
            seen: 0,
            fault,
        });
    }

    /// Run `hook` for every command. Hooks must not call back into this handle.
    pub fn on_command(&self, hook: impl FnMut(&str) + Send + 'static) {
        self.state.lock().hooks.push(Box::new(hook));
    }

    fn filtered(&self, kind: CallKind) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.command.clone())
            .collect()
    }
}

/// Scripted in-process transport.
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
    connected: bool,
    refuse_connect: bool,
    timeout: Duration,
}

impl MockAdapter {
    /// Adapter answering through `responder`; a `None` reply times out.
    pub fn with_responder(responder: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                responder: Box::new(responder),
                faults: Vec::new(),
                hooks: Vec::new(),
            })),
            connected: false,
            refuse_connect: false,
            timeout: Duration::from_secs(1),
        }
    }

    /// Adapter answering from a fixed table; unknown queries time out.
    pub fn with_responses<I, K, V>(responses: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let table: HashMap<String, String> = responses
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::with_responder(move |cmd| table.get(cmd).cloned())
    }

    /// Adapter simulating a Keithley 2281S with a battery attached.
    pub fn battery_simulator() -> Self {
        let mut sim = BatterySimulator::default();
        Self::with_responder(move |cmd| sim.respond(cmd))
    }

    /// Make `connect` fail with a connection error.
    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Handle for inspecting recorded commands.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn record(&self, command: &str, kind: CallKind) -> AppResult<Option<String>> {
        if !self.connected {
            return Err(DaqError::NotConnected);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.calls.push(MockCall {
            command: command.to_string(),
            kind,
        });
        for hook in state.hooks.iter_mut() {
            hook(command);
        }

        let fault = match kind {
            CallKind::Query => state.take_fault(command),
            CallKind::Write => None,
        };
        let reply = (state.responder)(command);
        match fault {
            None => Ok(reply),
            Some(Fault::Reply(text)) => Ok(Some(text)),
            Some(Fault::Timeout) => Err(DaqError::CommandTimeout {
                command: command.to_string(),
                timeout: self.timeout,
            }),
            Some(Fault::InvalidBytes) => Err(DaqError::ProtocolParse(format!(
                "non UTF-8 response to '{}'",
                command
            ))),
            Some(Fault::Disconnect) => Err(DaqError::Connection(format!(
                "connection closed while waiting for response to '{}'",
                command
            ))),
        }
    }
}

impl TransportChannel for MockAdapter {
    fn connect(&mut self) -> AppResult<()> {
        if self.refuse_connect {
            return Err(DaqError::Connection("mock transport refused connection".into()));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn write(&mut self, command: &str) -> AppResult<()> {
        self.record(command, CallKind::Write)?;
        debug!("Mock write: {}", command);
        Ok(())
    }

    fn query(&mut self, command: &str) -> AppResult<String> {
        let reply = self
            .record(command, CallKind::Query)?
            .ok_or_else(|| DaqError::CommandTimeout {
                command: command.to_string(),
                timeout: self.timeout,
            })?;
        debug!("Mock query '{}' -> '{}'", command, reply);
        Ok(reply)
    }

    fn info(&self) -> String {
        "Mock".to_string()
    }
}

/// Rough model of a battery on a Keithley 2281S, enough to exercise every test flow.
///
/// Output voltage sags by `current * esr` while the output is on. Battery-test and
/// model runs report busy on the operation-condition register for `busy_polls`
/// polls after they are started.
#[derive(Debug, Clone)]
pub struct BatterySimulator {
    ocv: f64,
    esr: f64,
    current: f64,
    output_on: bool,
    busy_polls: u32,
    busy_remaining: u32,
    model_points: u32,
}

impl Default for BatterySimulator {
    fn default() -> Self {
        Self {
            ocv: 3.95,
            esr: 0.08,
            current: 0.0,
            output_on: false,
            busy_polls: 3,
            busy_remaining: 0,
            model_points: 11,
        }
    }
}

impl BatterySimulator {
    fn terminal_voltage(&self) -> f64 {
        if self.output_on {
            self.ocv - self.current * self.esr
        } else {
            self.ocv
        }
    }

    fn output_current(&self) -> f64 {
        if self.output_on {
            self.current
        } else {
            0.0
        }
    }

    /// Reply to `command`, updating the simulated state.
    pub fn respond(&mut self, command: &str) -> Option<String> {
        let cmd = command.trim().trim_start_matches(':').to_ascii_uppercase();
        let (head, arg) = match cmd.split_once(' ') {
            Some((h, a)) => (h.to_string(), a.trim().to_string()),
            None => (cmd.clone(), String::new()),
        };

        match head.as_str() {
            "*IDN?" => Some("KEITHLEY INSTRUMENTS,MODEL 2281S-20-6,4587429,01.07a".into()),
            "*OPC?" => Some("1".into()),
            "OUTP" | "OUTP:STAT" | "BATT:OUTP" | "LOAD" => {
                self.output_on = arg == "ON" || arg == "1";
                if self.output_on && head == "BATT:OUTP" {
                    self.busy_remaining = self.busy_polls;
                }
                None
            }
            "SOUR:CURR" | "BATT:TEST:CURR:LIM:SOUR" | "CC:HIGH" => {
                if let Ok(value) = arg.parse::<f64>() {
                    self.current = value;
                }
                None
            }
            "BATT:TEST:SENS:AH:EXEC" => {
                self.busy_remaining = self.busy_polls;
                None
            }
            "MEAS:VOLT?" => Some(format!("{:.4}", self.terminal_voltage())),
            "MEAS:CURR?" => Some(format!("{:.4}", self.output_current())),
            "MEAS:POW?" => Some(format!(
                "{:.4}",
                self.terminal_voltage() * self.output_current()
            )),
            "READ?" => Some(format!(
                "{:.4},{:.4},{:.3}",
                self.output_current(),
                self.terminal_voltage(),
                0.0
            )),
            "STAT:OPER:INST:ISUM:COND?" => {
                if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                    Some("16".into())
                } else {
                    Some("0".into())
                }
            }
            "TRAC:POIN:ACT?" | "TRACE:POINTS:ACTUAL?" => Some(self.model_points.to_string()),
            _ if head.starts_with("BATT:MOD") && head.contains(":ROW") && head.ends_with('?') => {
                let row: f64 = head
                    .rsplit("ROW")
                    .next()
                    .and_then(|r| r.trim_end_matches('?').parse().ok())?;
                let span = f64::from(self.model_points.saturating_sub(1).max(1));
                let voc = 3.0 + 1.2 * row / span;
                Some(format!("{:.4},{:.4}", voc, self.esr + 0.01 * (1.0 - row / span)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_fail_before_connect() {
        let mut adapter = MockAdapter::with_responses([("*IDN?", "MOCK")]);
        assert!(matches!(adapter.query("*IDN?"), Err(DaqError::NotConnected)));
        assert!(adapter.handle().calls().is_empty());
    }

    #[test]
    fn test_records_writes_and_queries() {
        let mut adapter = MockAdapter::with_responses([("*IDN?", "MOCK,1")]);
        let handle = adapter.handle();
        adapter.connect().unwrap();
        adapter.write("*CLS").unwrap();
        assert_eq!(adapter.query("*IDN?").unwrap(), "MOCK,1");
        assert_eq!(handle.writes(), vec!["*CLS"]);
        assert_eq!(handle.queries(), vec!["*IDN?"]);
        assert_eq!(handle.write_count(), 1);
    }

    #[test]
    fn test_unknown_query_times_out() {
        let mut adapter = MockAdapter::with_responses(Vec::<(String, String)>::new());
        adapter.connect().unwrap();
        assert!(matches!(
            adapter.query("MEAS:VOLT?"),
            Err(DaqError::CommandTimeout { .. })
        ));
    }

    #[test]
    fn test_fault_hits_requested_occurrence_only() {
        let mut adapter = MockAdapter::battery_simulator();
        adapter.connect().unwrap();
        adapter.handle().inject(":MEAS:VOLT?", 2, Fault::Timeout);
        assert!(adapter.query(":MEAS:VOLT?").is_ok());
        assert!(adapter.query(":MEAS:VOLT?").is_err());
        assert!(adapter.query(":MEAS:VOLT?").is_ok());
    }

    #[test]
    fn test_refused_connection() {
        let mut adapter = MockAdapter::battery_simulator().refusing_connections();
        assert!(adapter.connect().unwrap_err().is_connection());
        assert!(!adapter.is_connected());
    }

    #[test]
    fn test_simulator_sags_under_load() {
        let mut sim = BatterySimulator::default();
        let idle: f64 = sim.respond(":MEAS:VOLT?").unwrap().parse().unwrap();
        sim.respond(":SOUR:CURR 1.0");
        sim.respond(":OUTP ON");
        let loaded: f64 = sim.respond(":MEAS:VOLT?").unwrap().parse().unwrap();
        assert!(loaded < idle);
        assert_eq!(sim.respond(":MEAS:CURR?").unwrap(), "1.0000");
    }

    #[test]
    fn test_simulator_reports_busy_then_idle() {
        let mut sim = BatterySimulator::default();
        sim.respond(":BATT:TEST:SENS:AH:EXEC STAR");
        let polls: Vec<String> = (0..4)
            .filter_map(|_| sim.respond(":STAT:OPER:INST:ISUM:COND?"))
            .collect();
        assert_eq!(polls, vec!["16", "16", "16", "0"]);
    }

    #[test]
    fn test_simulator_model_rows() {
        let mut sim = BatterySimulator::default();
        let first = sim.respond(":BATT:MOD4:ROW0?").unwrap();
        let last = sim.respond(":BATT:MOD4:ROW10?").unwrap();
        assert!(first.starts_with("3.0000,"));
        assert!(last.starts_with("4.2000,"));
    }
}
