//! Remote monitor: a JSON-RPC 2.0 line protocol over stdin/stdout.
//!
//! External tooling can peek and poke both emulated address spaces,
//! inspect CPU and video state, step the machine by lines or frames,
//! transfer the rendered frame, and save or restore snapshots. One
//! request per line, one response per line.

use std::io::{self, BufRead, Write};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::c64::{AddressSpace, C64};
use crate::palette::PALETTE;
use crate::vic::{DISPLAY_X, DISPLAY_Y};

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: JsonValue,
    id: JsonValue,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: JsonValue,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn success(id: JsonValue, result: JsonValue) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn failure(id: JsonValue, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError { code, message }),
            id,
        }
    }
}

fn parse_space(value: &JsonValue) -> Result<AddressSpace, String> {
    match value.get("space").and_then(JsonValue::as_str) {
        None | Some("main") => Ok(AddressSpace::Main),
        Some("drive") => Ok(AddressSpace::Drive),
        Some(other) => Err(format!("unknown address space '{other}'")),
    }
}

#[derive(Deserialize)]
struct MemParams {
    addr: u16,
    #[serde(default)]
    value: Option<u8>,
}

#[derive(Deserialize)]
struct CountParams {
    #[serde(default = "one")]
    count: u32,
}

fn one() -> u32 {
    1
}

#[derive(Deserialize)]
struct DataParams {
    data: String,
}

/// A remote monitor wrapping a machine.
pub struct Monitor {
    c64: C64,
}

impl Monitor {
    #[must_use]
    pub fn new(c64: C64) -> Self {
        Self { c64 }
    }

    /// Give the machine back.
    #[must_use]
    pub fn into_inner(self) -> C64 {
        self.c64
    }

    /// Serve requests from stdin until it closes.
    pub fn run(&mut self) {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut stdout = stdout.lock();

        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = self.handle_line(line);
            let _ = writeln!(stdout, "{response}");
            let _ = stdout.flush();
        }
    }

    /// Handle one request line, producing one response line.
    pub fn handle_line(&mut self, line: &str) -> String {
        let response = match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => {
                if request.jsonrpc == "2.0" {
                    self.dispatch(&request.method, &request.params, request.id)
                } else {
                    RpcResponse::failure(
                        request.id,
                        -32600,
                        "invalid JSON-RPC version".to_string(),
                    )
                }
            }
            Err(e) => RpcResponse::failure(JsonValue::Null, -32700, format!("parse error: {e}")),
        };
        serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"encode error"},"id":null}"#
                .to_string()
        })
    }

    fn dispatch(&mut self, method: &str, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let result = match method {
            "peek" => self.handle_peek(params),
            "poke" => self.handle_poke(params),
            "cpu_state" => self.handle_cpu_state(params),
            "vic_state" => Ok(self.handle_vic_state()),
            "drive_state" => Ok(self.handle_drive_state()),
            "step_line" => self.handle_step_line(params),
            "run_frame" => self.handle_run_frame(params),
            "screen" => Ok(self.handle_screen()),
            "save_state" => Ok(self.handle_save_state()),
            "load_state" => self.handle_load_state(params),
            "reset" => Ok(self.handle_reset(params)),
            "notifications" => Ok(self.handle_notifications()),
            _ => Err(format!("unknown method '{method}'")),
        };
        match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(message) => RpcResponse::failure(id, -32602, message),
        }
    }

    fn handle_peek(&mut self, params: &JsonValue) -> Result<JsonValue, String> {
        let space = parse_space(params)?;
        let mem: MemParams =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        let value = self.c64.peek(space, mem.addr);
        Ok(json!({ "addr": mem.addr, "value": value }))
    }

    fn handle_poke(&mut self, params: &JsonValue) -> Result<JsonValue, String> {
        let space = parse_space(params)?;
        let mem: MemParams =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        let value = mem.value.ok_or("poke needs a value")?;
        self.c64.poke(space, mem.addr, value);
        Ok(json!({ "ok": true }))
    }

    fn handle_cpu_state(&mut self, params: &JsonValue) -> Result<JsonValue, String> {
        let space = parse_space(params)?;
        let state = match space {
            AddressSpace::Main => self.c64.cpu().state(),
            AddressSpace::Drive => self.c64.bus().drive.cpu_state().0,
        };
        Ok(json!({
            "a": state.a,
            "x": state.x,
            "y": state.y,
            "sp": state.sp,
            "pc": state.pc,
            "p": state.p,
            "cycle_counter": state.cycle_counter,
            "jammed": state.jammed,
        }))
    }

    fn handle_vic_state(&self) -> JsonValue {
        let vic = self.c64.bus().vic.state();
        json!({
            "raster_y": vic.raster_y,
            "irq_raster": vic.irq_raster,
            "irq_flag": vic.irq_flag,
            "irq_mask": vic.irq_mask,
            "display_state": vic.display_state,
            "bad_lines_enabled": vic.bad_lines_enabled,
            "border_on": vic.border_on,
            "sprite_on": vic.sprite_on,
            "vc": vic.vc,
            "rc": vic.rc,
        })
    }

    fn handle_drive_state(&self) -> JsonValue {
        let drive = &self.c64.bus().drive;
        let (cpu, idle) = drive.cpu_state();
        json!({
            "pc": cpu.pc,
            "idle": idle,
            "jammed": cpu.jammed,
            "track": drive.bus.disk.track(),
            "motor_on": drive.bus.disk.motor_on(),
            "has_disk": drive.bus.disk.has_disk(),
            "led": format!("{:?}", drive.led()),
        })
    }

    fn handle_step_line(&mut self, params: &JsonValue) -> Result<JsonValue, String> {
        let count: CountParams =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        let mut cycles = 0u64;
        for _ in 0..count.count {
            cycles += u64::from(self.c64.step_line().cpu_cycles);
        }
        Ok(json!({ "lines": count.count, "cycles": cycles }))
    }

    fn handle_run_frame(&mut self, params: &JsonValue) -> Result<JsonValue, String> {
        let count: CountParams =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        let mut cycles = 0u64;
        for _ in 0..count.count {
            cycles += u64::from(self.c64.run_frame());
        }
        Ok(json!({ "frames": count.count, "cycles": cycles }))
    }

    fn handle_screen(&self) -> JsonValue {
        // Map the chunky buffer through the palette to ARGB32.
        let frame = self.c64.frame();
        let mut argb = Vec::with_capacity(DISPLAY_X * DISPLAY_Y * 4);
        for y in 0..frame.height() {
            let row = frame.row(y).expect("row inside frame");
            for &px in row {
                argb.extend_from_slice(&PALETTE[(px & 0x0f) as usize].to_le_bytes());
            }
        }
        let data = base64::engine::general_purpose::STANDARD.encode(&argb);
        json!({
            "width": frame.width(),
            "height": frame.height(),
            "format": "argb32",
            "data": data,
        })
    }

    fn handle_save_state(&self) -> JsonValue {
        let bytes = self.c64.save_state_bytes();
        json!({ "data": base64::engine::general_purpose::STANDARD.encode(&bytes) })
    }

    fn handle_load_state(&mut self, params: &JsonValue) -> Result<JsonValue, String> {
        let data: DataParams =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.data)
            .map_err(|e| e.to_string())?;
        self.c64.restore_state_bytes(&bytes)?;
        Ok(json!({ "ok": true }))
    }

    fn handle_reset(&mut self, params: &JsonValue) -> JsonValue {
        let clear = params
            .get("clear_memory")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        self.c64.reset(clear);
        json!({ "ok": true })
    }

    fn handle_notifications(&mut self) -> JsonValue {
        let mut all = Vec::new();
        while let Some(n) = self.c64.take_notification() {
            all.push(n);
        }
        json!({ "notifications": all })
    }
}
