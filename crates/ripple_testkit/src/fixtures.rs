//! Object models and engine helpers.
//!
//! - `Demo`: `title` and `users` fields, a cached `render`, and the
//!   `rename(title)` and `add_user(name)` transactions.
//! - `DemoView`: holds a `model` reference to a `Demo` and renders it
//!   through the model's own cached `render`.
//! - `Watched`: one `value` field and two triggers of different priority
//!   that append to a shared log.
//! - `AsyncDemo`: an async `load(url, delay)` transaction that sleeps, then
//!   records the url, under a chosen reentrance policy.

use parking_lot::Mutex;
use ripple_core::{
    CacheOptions, Context, CoreError, CoreResult, Engine, Monitor, ObjectHandle, ObjectType, Reentrance, Value,
};
use std::sync::Arc;
use std::time::Duration;

/// Shared log that trigger bodies append to.
pub type TriggerLog = Arc<Mutex<Vec<String>>>;

/// Builds the `Demo` type.
pub fn demo_type() -> Arc<ObjectType> {
    ObjectType::builder("Demo")
        .field("title")
        .field("users")
        .cached("render", CacheOptions::cached(), |ctx, this, _| {
            let title = ctx.get(this, "title")?;
            let users = ctx.get(this, "users")?;
            let count = users.as_list().map_or(0, <[Value]>::len);
            Ok(Value::from(format!("<h1>{title}</h1><p>{count} users</p>")))
        })
        .transaction("rename", CacheOptions::transaction(), |ctx, this, args| {
            let title = args
                .first()
                .cloned()
                .ok_or_else(|| CoreError::failed("rename expects a title"))?;
            ctx.set(this, "title", title)?;
            Ok(Value::Null)
        })
        .transaction("add_user", CacheOptions::transaction(), |ctx, this, args| {
            let name = args
                .first()
                .cloned()
                .ok_or_else(|| CoreError::failed("add_user expects a name"))?;
            ctx.update(this, "users", |users| {
                if let Some(list) = users.list_mut() {
                    list.push(name);
                }
            })?;
            Ok(Value::Null)
        })
        .build()
}

/// Creates a `Demo` with the given title and no users.
pub fn create_demo(engine: &Engine, ty: &Arc<ObjectType>, title: &str) -> CoreResult<ObjectHandle> {
    engine.transaction("create Demo", |ctx| {
        ctx.create(
            ty,
            [("title", Value::from(title)), ("users", Value::list(Vec::new()))],
        )
    })
}

/// Builds the `DemoView` type.
pub fn demo_view_type() -> Arc<ObjectType> {
    ObjectType::builder("DemoView")
        .field("model")
        .cached("render", CacheOptions::cached(), |ctx, this, _| {
            let model = model_of(ctx, this)?;
            let inner = ctx.call(&model, "render", &[])?;
            Ok(Value::from(format!("<main>{inner}</main>")))
        })
        .build()
}

fn model_of(ctx: &Context, view: &ObjectHandle) -> CoreResult<ObjectHandle> {
    let id = ctx
        .get(view, "model")?
        .as_object()
        .ok_or_else(|| CoreError::failed("DemoView.model is not an object"))?;
    ctx.engine()
        .object(id)
        .ok_or_else(|| CoreError::failed(format!("{id} is not registered")))
}

/// Creates a `DemoView` over `model`.
pub fn create_demo_view(engine: &Engine, ty: &Arc<ObjectType>, model: &ObjectHandle) -> CoreResult<ObjectHandle> {
    engine.transaction("create DemoView", |ctx| {
        ctx.create(ty, [("model", Value::from(model.id()))])
    })
}

/// Builds the `Watched` type. Trigger `low` (priority 1) is declared before
/// trigger `high` (priority 5); each appends `name:value` to `log`.
pub fn watched_type(log: &TriggerLog) -> Arc<ObjectType> {
    let low = Arc::clone(log);
    let high = Arc::clone(log);
    ObjectType::builder("Watched")
        .field("value")
        .trigger("low", CacheOptions::trigger().priority(1), move |ctx, this, _| {
            let value = ctx.get(this, "value")?;
            low.lock().push(format!("low:{value}"));
            Ok(value)
        })
        .trigger("high", CacheOptions::trigger().priority(5), move |ctx, this, _| {
            let value = ctx.get(this, "value")?;
            high.lock().push(format!("high:{value}"));
            Ok(value)
        })
        .build()
}

/// Creates a `Watched` object holding `value`.
pub fn create_watched(engine: &Engine, ty: &Arc<ObjectType>, value: i64) -> CoreResult<ObjectHandle> {
    engine.transaction("create Watched", |ctx| ctx.create(ty, [("value", Value::from(value))]))
}

/// Builds the `AsyncDemo` type with `load` under `reentrance`, optionally
/// tagged with `monitor`.
///
/// `load(url, delay)` sleeps `delay` milliseconds, then sets `url`, appends
/// `url/delay` to `log`, and returns the url.
pub fn async_demo_type(reentrance: Reentrance, monitor: Option<Arc<Monitor>>) -> Arc<ObjectType> {
    let mut options = CacheOptions::transaction().reentrance(reentrance);
    if let Some(monitor) = monitor {
        options = options.monitor(monitor);
    }
    ObjectType::builder("AsyncDemo")
        .field("url")
        .field("log")
        .transaction_async("load", options, |ctx: Context, this: ObjectHandle, args: Vec<Value>| async move {
            let url = args.first().cloned().unwrap_or(Value::Null);
            let delay = args.get(1).and_then(Value::as_integer).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay.unsigned_abs())).await;
            ctx.set(&this, "url", url.clone())?;
            let entry = Value::from(format!("{url}/{delay}"));
            ctx.update(&this, "log", |log| {
                if let Some(list) = log.list_mut() {
                    list.push(entry);
                }
            })?;
            Ok::<_, CoreError>(url)
        })
        .build()
}

/// Creates an `AsyncDemo` with no url and an empty log.
pub fn create_async_demo(engine: &Engine, ty: &Arc<ObjectType>) -> CoreResult<ObjectHandle> {
    engine.transaction("create AsyncDemo", |ctx| {
        ctx.create(ty, [("url", Value::Null), ("log", Value::list(Vec::new()))])
    })
}

/// Arguments of `AsyncDemo.load`.
pub fn load_args(url: &str, delay_ms: i64) -> Vec<Value> {
    vec![Value::from(url), Value::from(delay_ms)]
}

/// Returns the `log` field of an `AsyncDemo` as strings.
pub fn load_log(engine: &Engine, demo: &ObjectHandle) -> CoreResult<Vec<String>> {
    let log = engine.get(demo, "log")?;
    Ok(log
        .as_list()
        .unwrap_or_default()
        .iter()
        .map(ToString::to_string)
        .collect())
}
