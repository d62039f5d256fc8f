use serde::Serialize;
use std::sync::Arc;
use tauri::{
    plugin::{Builder, TauriPlugin},
    AppHandle, Emitter, Manager, RunEvent, Runtime, State,
};

use crate::{
    config::load_settings,
    manager::RdpManager,
    platform::Platform,
    probe::DependencyReport,
    profile::ConnectionRequest,
    session::{SessionSignal, SessionStatus},
};

const SESSION_SIGNAL_EVENT: &str = "rdp:session-signal";
const DEFAULT_LOG_LIMIT: usize = 200;

pub struct RdpState {
    inner: Arc<RdpManager>,
}

impl RdpState {
    pub fn new(manager: RdpManager) -> Self {
        Self {
            inner: Arc::new(manager),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSignalPayload {
    id: String,
    signal: SessionSignal,
}

fn require_id(id: &str) -> Result<String, String> {
    let id = id.trim();
    if id.is_empty() {
        return Err("RDP session id is required".to_string());
    }
    Ok(id.to_string())
}

#[tauri::command]
pub async fn rdp_connect<R: Runtime>(
    app: AppHandle<R>,
    state: State<'_, RdpState>,
    request: ConnectionRequest,
) -> Result<String, String> {
    let handle = state
        .inner
        .connect(request)
        .await
        .map_err(|err| format!("{err:#}"))?;

    let id = handle.id.clone();
    let mut signals = handle.signals;
    tauri::async_runtime::spawn(async move {
        while let Some(signal) = signals.recv().await {
            let closing = signal == SessionSignal::Close;
            let payload = SessionSignalPayload {
                id: handle.id.clone(),
                signal,
            };
            if let Err(err) = app.emit(SESSION_SIGNAL_EVENT, payload) {
                log::warn!("failed to emit rdp signal for {}: {err}", handle.id);
            }
            if closing {
                break;
            }
        }
    });
    Ok(id)
}

// Cleanup shells out to the credential store on Windows.
async fn disconnect_off_main_thread(manager: Arc<RdpManager>, id: String) -> Result<(), String> {
    tauri::async_runtime::spawn_blocking(move || manager.disconnect(&id))
        .await
        .map_err(|err| format!("disconnect task failed: {err}"))
}

#[tauri::command]
pub async fn rdp_disconnect(state: State<'_, RdpState>, id: String) -> Result<(), String> {
    let id = require_id(&id)?;
    disconnect_off_main_thread(Arc::clone(&state.inner), id).await
}

#[tauri::command]
pub fn rdp_status(
    state: State<'_, RdpState>,
    id: Option<String>,
) -> Result<Vec<SessionStatus>, String> {
    if let Some(id) = id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return Ok(state.inner.status(&id).into_iter().collect());
    }
    Ok(state.inner.statuses())
}

#[tauri::command]
pub fn rdp_logs(
    state: State<'_, RdpState>,
    id: String,
    limit: Option<usize>,
) -> Result<Vec<String>, String> {
    let id = require_id(&id)?;
    let cap = limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .min(state.inner.settings().max_log_lines);
    Ok(state.inner.logs(&id, cap))
}

#[tauri::command]
pub fn rdp_logs_clear(state: State<'_, RdpState>, id: String) -> Result<(), String> {
    let id = require_id(&id)?;
    state.inner.clear_logs(&id);
    Ok(())
}

#[tauri::command]
pub fn rdp_dependencies(state: State<'_, RdpState>) -> Result<DependencyReport, String> {
    Ok(state.inner.dependencies())
}

pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("rdp")
        .invoke_handler(tauri::generate_handler![
            rdp_connect,
            rdp_disconnect,
            rdp_status,
            rdp_logs,
            rdp_logs_clear,
            rdp_dependencies,
        ])
        .setup(|app, _api| {
            let manager = RdpManager::new(Platform::current(), load_settings());
            app.manage(RdpState::new(manager));
            Ok(())
        })
        .on_event(|app, event| {
            if let RunEvent::Exit = event {
                if let Some(state) = app.try_state::<RdpState>() {
                    log::info!("closing remote desktop sessions on exit");
                    state.inner.close_all();
                }
            }
        })
        .build()
}

pub fn log_plugin<R: Runtime>() -> TauriPlugin<R> {
    tauri_plugin_log::Builder::default()
        .level(log::LevelFilter::Info)
        .clear_targets()
        .targets([
            tauri_plugin_log::Target::new(tauri_plugin_log::TargetKind::Stdout),
            tauri_plugin_log::Target::new(tauri_plugin_log::TargetKind::Webview),
        ])
        .build()
}
