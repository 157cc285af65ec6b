use std::collections::HashMap;

use anyhow::{Context, Result};
use mpw_storage::{HistoryStore, MetricsStore};

/// Markdown digest of recent sessions and events.
pub async fn report_markdown(
    history: &HistoryStore,
    metrics: &MetricsStore,
    limit: i64,
) -> Result<String> {
    let limit = limit.max(1);
    let sessions = metrics
        .recent_sessions(limit)
        .await
        .context("loading recent sessions")?;
    let events = history
        .recent_events(limit * 10)
        .await
        .context("loading recent events")?;
    let items: HashMap<i64, String> = history
        .list_items()
        .await
        .context("loading items")?
        .into_iter()
        .map(|item| (item.id, format!("{} ({})", item.name, item.store)))
        .collect();

    let pending = history
        .pending_events(limit * 10)
        .await
        .context("loading pending events")?;

    let mut lines = vec!["# Price Watch Report".to_string(), String::new()];
    lines.push(format!("- items watched: {}", items.len()));
    lines.push(format!("- events awaiting notification: {}", pending.len()));
    lines.push(String::new());

    lines.push("## Sessions".to_string());
    if sessions.is_empty() {
        lines.push("- none recorded".to_string());
    }
    for session in &sessions {
        let status = match (session.ended_at, session.exit_reason) {
            (Some(ended), Some(reason)) => format!("ended {} ({reason})", ended.to_rfc3339()),
            _ => "running".to_string(),
        };
        lines.push(format!(
            "- session `{}` started {}: {} items, {} ok, {} failed, {status}",
            session.id,
            session.started_at.to_rfc3339(),
            session.total_items,
            session.success_items,
            session.failed_items,
        ));
        for stat in metrics
            .store_stats(session.id)
            .await
            .with_context(|| format!("loading store stats for session {}", session.id))?
        {
            lines.push(format!(
                "  - {}: {} items, {} ok, {} failed",
                stat.store_name, stat.item_count, stat.success_count, stat.failed_count
            ));
        }
    }
    lines.push(String::new());

    lines.push("## Events".to_string());
    if events.is_empty() {
        lines.push("- none recorded".to_string());
    }
    for event in &events {
        let item = items
            .get(&event.item_id)
            .map(String::as_str)
            .unwrap_or("unknown item");
        let mut line = format!(
            "- {} `{}` {}",
            event.created_at.to_rfc3339(),
            event.event_type,
            item
        );
        match (event.old_price, event.price) {
            (Some(old), Some(new)) => line.push_str(&format!(": {old} -> {new}")),
            (None, Some(new)) => line.push_str(&format!(": {new}")),
            _ => {}
        }
        if let Some(days) = event.threshold_days {
            line.push_str(&format!(" (lowest in {days}d)"));
        }
        lines.push(line);
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mpw_core::{EventType, ExitReason, ItemUpsert, NewEvent, StoreCounts};
    use tempfile::tempdir;

    #[tokio::test]
    async fn report_lists_sessions_and_price_drops() {
        let dir = tempdir().expect("tempdir");
        let history = HistoryStore::open_and_init(dir.path().join("history.db")).await.unwrap();
        let metrics = MetricsStore::open_and_init(dir.path().join("metrics.db")).await.unwrap();

        let now = Utc::now();
        let session = metrics.start_session(now).await.unwrap();
        let counts = StoreCounts { items: 1, success: 1, failed: 0 };
        metrics.end_session(session, ExitReason::Normal, counts, now).await.unwrap();

        let item_id = history
            .upsert_item(
                &ItemUpsert {
                    item_key: "k".into(),
                    name: "Lens".into(),
                    store: "camera-shop".into(),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        history
            .insert_event(&NewEvent {
                item_id,
                event_type: EventType::PriceDecrease,
                price: Some(800),
                old_price: Some(1000),
                threshold_days: Some(30),
                created_at: now,
            })
            .await
            .unwrap();

        let report = report_markdown(&history, &metrics, 5).await.unwrap();
        assert!(report.contains("# Price Watch Report"));
        assert!(report.contains("(normal)"));
        assert!(report.contains("- events awaiting notification: 1"));
        assert!(report.contains("`price_decrease` Lens (camera-shop): 1000 -> 800 (lowest in 30d)"));
    }
}
