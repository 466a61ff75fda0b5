//! Cross-form commit and rollback.

use std::sync::Arc;

use crate::context::ApplicationContext;
use crate::error::Result;
use crate::render::Severity;
use crate::triggers::{EventKind, TriggerEvent};

/// Validate every open form, flush every dirty record, commit every
/// connected session, and only then mark the forms clean.
///
/// Returns `Ok(false)` when a validation, flush or PreCommit trigger stopped
/// the commit before any session was committed.
pub async fn commit(ctx: &Arc<ApplicationContext>) -> Result<bool> {
    let forms = ctx.forms();

    for form in &forms {
        if !form.validate().await? {
            log::info!("commit: form '{}' has invalid rows", form.name());
            return Ok(false);
        }
    }
    for form in &forms {
        if !form.flush_all().await? {
            log::info!("commit: form '{}' could not be flushed", form.name());
            return Ok(false);
        }
    }
    for form in &forms {
        let ev = TriggerEvent::form(EventKind::PreCommit, form.name());
        if !ctx.triggers().fire(ev).await {
            ctx.message(Severity::Info, "Commit", format!("{}: commit cancelled", form.name()));
            return Ok(false);
        }
    }

    for conn in ctx.connections() {
        if !conn.is_connected() {
            continue;
        }
        if let Err(e) = conn.commit().await {
            log::error!("commit on {} failed: {e}", conn.name());
            ctx.report(&e);
            return Err(e);
        }
    }

    for form in &forms {
        form.synchronize();
        ctx.triggers()
            .fire(TriggerEvent::form(EventKind::PostCommit, form.name()))
            .await;
    }
    log::info!("commit: {} form(s) synchronized", forms.len());
    Ok(true)
}

/// Clear the view of dirty forms, roll back every connected session, then
/// undo each form. The first form whose undo fails stops the sweep.
pub async fn rollback(ctx: &Arc<ApplicationContext>) -> Result<bool> {
    let forms = ctx.forms();

    for form in &forms {
        if form.is_dirty() {
            form.clear_view();
        }
    }

    for conn in ctx.connections() {
        if !conn.is_connected() {
            continue;
        }
        if let Err(e) = conn.rollback().await {
            log::error!("rollback on {} failed: {e}", conn.name());
            ctx.report(&e);
            return Err(e);
        }
    }

    for form in &forms {
        if let Err(e) = form.undo().await {
            log::error!("rollback: {e}");
            ctx.report(&e);
            return Err(e);
        }
    }
    log::info!("rollback: {} form(s) restored", forms.len());
    Ok(true)
}
