use log::info;
use serde_json::Value;
use widgetsync_bridge_runtime::{WidgetAddress, WidgetRenderer, WidgetView};

#[derive(Debug, Default)]
pub struct LogRenderer;

impl WidgetRenderer for LogRenderer {
    fn render(&mut self, view: &WidgetView) {
        info!("{}", render_line(view));
    }

    fn unmounted(&mut self, address: &WidgetAddress) {
        info!("{address} unmounted");
    }
}

pub fn render_line(view: &WidgetView) -> String {
    let status = view
        .state
        .get("status")
        .and_then(Value::as_str)
        .filter(|status| !status.is_empty())
        .unwrap_or("pending");
    let message = view
        .state
        .get("status_message")
        .and_then(Value::as_str)
        .unwrap_or("");

    let mut line = format!(
        "{} [{}] {:?} status={status}",
        view.address, view.title, view.phase
    );

    if !message.is_empty() {
        line.push_str(&format!(" message={message:?}"));
    }

    if let Some(failure) = &view.failure {
        line.push_str(&format!(" failure={failure:?}"));
    }

    line
}
