//! Sample module
//!
//! Build with `cargo build --release` and copy the library from
//! `target/release/` into the host's modules directory. It is served under
//! `/hello/`.

use rust_module_host_sdk::prelude::*;

const NAMES: &str = "names";

#[derive(Debug, Serialize, Deserialize)]
struct NameRecord {
    name: String,
}

#[derive(Default)]
pub struct HelloModule;

impl Module for HelloModule {
    fn routes(&self, routes: &mut RouteTable) {
        routes.get("", |_ctx, _req| async {
            Response::html(200, "<h1>Hello module</h1><p>Try <code>hello/world</code>.</p>")
        });

        routes.get("world", |ctx, req| async move {
            Response::ok(json!({
                "message": "Hello World!",
                "module": ctx.module_name(),
                "path": req.path,
            }))
        });

        routes.map_result("PUT", "name", |ctx, req| async move {
            let name: String = req.require_field("name")?;
            let id = req.request_id.clone();
            ctx.storage()?.set_as(NAMES, &id, &NameRecord { name })?;
            Ok(Response::created(json!({ "name_id": id })))
        });

        routes.map_result("GET", "name", |ctx, req| async move {
            let id: String = req.require_field("name_id")?;
            match ctx.storage()?.get_as::<NameRecord>(NAMES, &id)? {
                Some(record) => Ok(Response::ok(record)),
                None => Err(HandlerError::NotFound),
            }
        });

        routes.map_result("DELETE", "name", |ctx, req| async move {
            let id: String = req.require_field("name_id")?;
            if ctx.storage()?.delete(NAMES, &id)? {
                Ok(Response::no_content())
            } else {
                Err(HandlerError::NotFound)
            }
        });

        // Asks the `clock` module for the time, if one is loaded
        routes.map_result("GET", "time", |ctx, _req| async move {
            let reply = ctx.request("clock", Payload::new().with("format", "rfc3339")).await?;
            Ok(Response::ok(reply.data))
        });
    }

    fn on_load<'a>(&'a self, ctx: &'a ModuleContext) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            // The library links its own copy of `tracing`, so it needs its own subscriber
            let _ = tracing_subscriber::fmt().with_target(true).try_init();

            let replies = ctx.clone();
            ctx.on_message(move |msg| {
                let name = msg.data.optional::<String>("name").ok().flatten().unwrap_or_else(|| "stranger".to_string());
                replies.reply(&msg, Payload::new().with("greeting", format!("Hello, {}!", name)));
            });

            ctx.subscribe(channels::MODULE_LOADED, |event| {
                if let LifecycleEvent::ModuleLoaded { name, .. } = event {
                    tracing::info!(module = %name, "Module loaded");
                }
            });
            Ok(())
        })
    }
}

export_module!(HelloModule);
