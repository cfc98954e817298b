use crate::app::AppContext;
use crate::cli::{
    CaptureArgs, ContactsCommand, FeedsCommand, GalleryCommand, SettingsCommand, SmsArgs, SosArgs,
    WeatherArgs,
};
use crate::contacts::{ContactBook, ContactPatch, NewContact};
use crate::feeds::{DisplayMode, FeedId, FeedRegistry, FeedUpdate};
use crate::gallery::{Gallery, write_frame};
use crate::live::{FeedHandle, FeedSpec, http_client, spawn_feed};
use crate::settings::{RobotSettings, SettingKey};
use crate::viewer::CellGeometry;
use crate::weather::{Location, PRESET_LOCATIONS, WeatherSource, find_location};
use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::info;

const CAPTURE_GRACE: Duration = Duration::from_secs(2);
const WATCH_POLL: Duration = Duration::from_millis(250);

pub fn feeds(ctx: &AppContext, command: FeedsCommand) -> Result<()> {
    let mut registry = FeedRegistry::load(Arc::clone(&ctx.store));
    match command {
        FeedsCommand::List(args) => {
            if args.json {
                let feeds: Vec<_> = registry
                    .iter()
                    .map(|(id, feed)| {
                        json!({
                            "id": id.as_str(),
                            "name": id.display_name(),
                            "url": feed.url,
                            "active": feed.active,
                            "mode": feed.mode,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&feeds)?);
                return Ok(());
            }

            println!("{:<18}  {:<6}  {:<7}  URL", "FEED", "ACTIVE", "MODE");
            for (id, feed) in registry.iter() {
                println!(
                    "{:<18}  {:<6}  {:<7}  {}",
                    id.as_str(),
                    if feed.active { "yes" } else { "no" },
                    feed.mode,
                    feed.url
                );
            }
        }
        FeedsCommand::SetUrl { feed, url } => {
            if url.trim().is_empty() {
                bail!("feed URL cannot be empty");
            }
            let saved = registry.save(feed, FeedUpdate::url(url))?;
            println!("{} now streams from {}", feed.display_name(), saved.url);
        }
        FeedsCommand::Activate { feed } => {
            registry.save(feed, FeedUpdate::active(true))?;
            println!("{} feed activated", feed.display_name());
        }
        FeedsCommand::Deactivate { feed } => {
            registry.save(feed, FeedUpdate::active(false))?;
            println!("{} feed deactivated", feed.display_name());
        }
        FeedsCommand::Mode { feed, mode } => {
            registry.save(feed, FeedUpdate::mode(mode))?;
            println!("{} feed displays as {mode}", feed.display_name());
        }
        FeedsCommand::Reset => {
            registry.reset()?;
            println!("Feed configuration restored to defaults");
        }
    }
    Ok(())
}

pub fn gallery(ctx: &AppContext, command: GalleryCommand) -> Result<()> {
    let mut gallery = Gallery::load(Arc::clone(&ctx.store));
    match command {
        GalleryCommand::List(args) => {
            if args.json {
                let frames: Vec<_> = gallery
                    .frames()
                    .iter()
                    .map(|frame| {
                        json!({
                            "id": frame.id,
                            "source_name": frame.source_name,
                            "captured_at": frame.captured_at,
                            "file_name": frame.download_file_name(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&frames)?);
                return Ok(());
            }

            if gallery.is_empty() {
                println!("No captured frames yet. Use `rescue-console capture --feed <feed>`.");
                return Ok(());
            }
            println!("{:<14}  {:<18}  {:<25}  SIZE", "ID", "SOURCE", "CAPTURED");
            for frame in gallery.frames() {
                let size = frame.jpeg_bytes().map_or(0, |bytes| bytes.len());
                println!(
                    "{:<14}  {:<18}  {:<25}  {} KiB",
                    frame.id,
                    frame.source_name,
                    frame.captured_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    size.div_ceil(1024)
                );
            }
        }
        GalleryCommand::Delete { id } => {
            if !gallery.delete(&id)? {
                bail!("no saved frame with id '{id}'");
            }
            println!("Deleted frame {id}");
        }
        GalleryCommand::Clear => {
            let removed = gallery.clear()?;
            println!("Deleted {removed} frame(s)");
        }
        GalleryCommand::Export { id, out } => {
            let dir = out.unwrap_or_else(|| ctx.downloads_dir());
            let path = gallery.download(&id, &dir)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

pub fn contacts(ctx: &AppContext, command: ContactsCommand) -> Result<()> {
    let mut book = ContactBook::load(Arc::clone(&ctx.store));
    match command {
        ContactsCommand::List(args) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(book.contacts())?);
                return Ok(());
            }
            if book.is_empty() {
                println!("No emergency contacts. Add one with `rescue-console contacts add`.");
                return Ok(());
            }
            println!("{:<14}  {:<20}  {:<18}  RELATIONSHIP", "ID", "NAME", "PHONE");
            for contact in book.contacts() {
                println!(
                    "{:<14}  {:<20}  {:<18}  {}",
                    contact.id,
                    contact.name,
                    contact.phone,
                    contact.relationship.as_deref().unwrap_or("-")
                );
            }
        }
        ContactsCommand::Add {
            name,
            phone,
            relationship,
        } => {
            let contact = book.add(NewContact {
                name,
                phone,
                relationship,
            })?;
            println!("Added {} ({})", contact.name, contact.id);
        }
        ContactsCommand::Update {
            contact,
            name,
            phone,
            relationship,
        } => {
            let id = resolve_contact(&book, &contact)?;
            let updated = book.update(
                &id,
                ContactPatch {
                    name,
                    phone,
                    relationship,
                },
            )?;
            println!("Updated {} ({})", updated.name, updated.id);
        }
        ContactsCommand::Remove { contact } => {
            let id = resolve_contact(&book, &contact)?;
            let removed = book.remove(&id)?;
            println!("Removed {}", removed.name);
        }
    }
    Ok(())
}

fn resolve_contact(book: &ContactBook, id_or_name: &str) -> Result<String> {
    book.find(id_or_name)
        .map(|contact| contact.id.clone())
        .ok_or_else(|| anyhow!("no emergency contact matches '{id_or_name}'"))
}

pub async fn sos(ctx: &AppContext, args: SosArgs) -> Result<()> {
    let book = ContactBook::load(Arc::clone(&ctx.store));
    let notifier = ctx.notifier();
    let report = notifier
        .send_sos(book.contacts(), args.message.as_deref())
        .await?;

    for delivery in &report.deliveries {
        match &delivery.outcome {
            Ok(()) => println!("  sent    {} <{}>", delivery.contact_name, delivery.phone),
            Err(err) => println!("  failed  {} <{}>: {err}", delivery.contact_name, delivery.phone),
        }
    }
    println!("{} (via {} gateway)", report.summary(), notifier.gateway_name());
    if report.sent_count() == 0 {
        bail!("SOS could not be delivered to any contact");
    }
    Ok(())
}

pub async fn sms(ctx: &AppContext, args: SmsArgs) -> Result<()> {
    let notifier = ctx.notifier();
    notifier.send_sms(&args.to, &args.message).await?;
    println!("SMS sent to {} (via {} gateway)", args.to.trim(), notifier.gateway_name());
    Ok(())
}

pub async fn weather(ctx: &AppContext, args: WeatherArgs) -> Result<()> {
    let (name, lat, lon) = resolve_location(&args)?;
    let report = ctx.weather_client().fetch(lat, lon).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{name}");
    println!("  {:.1} °C, {}", report.temperature, report.description);
    println!("  humidity {}%  wind {:.1} m/s", report.humidity, report.wind_speed);
    if report.source == WeatherSource::Fallback {
        println!("  (simulated data; set weather_api_key in config.json or OPENWEATHER_API_KEY)");
    }
    Ok(())
}

fn resolve_location(args: &WeatherArgs) -> Result<(String, f64, f64)> {
    if let (Some(lat), Some(lon)) = (args.lat, args.lon) {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            bail!("coordinates out of range: {lat}, {lon}");
        }
        return Ok((format!("{lat:.4}, {lon:.4}"), lat, lon));
    }
    let location: Location = match args.location.as_deref() {
        Some(name) => *find_location(name).ok_or_else(|| {
            anyhow!(
                "unknown location '{name}' (known: {})",
                PRESET_LOCATIONS.map(|l| l.name).join(", ")
            )
        })?,
        None => PRESET_LOCATIONS[0],
    };
    Ok((location.name.to_owned(), location.lat, location.lon))
}

pub fn settings(ctx: &AppContext, command: SettingsCommand) -> Result<()> {
    let mut settings = RobotSettings::load(&*ctx.store);
    match command {
        SettingsCommand::Show(args) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
                return Ok(());
            }
            for key in SettingKey::ALL {
                println!("{:<24}  {}", key.label(), settings.value(key));
            }
        }
        SettingsCommand::Set { key, value } => {
            settings.apply(key, &value)?;
            settings.save(&*ctx.store)?;
            println!("{} = {}", key.label(), settings.value(key));
        }
        SettingsCommand::Reset => {
            settings.reset();
            settings.save(&*ctx.store)?;
            println!("Settings restored to defaults");
        }
    }
    Ok(())
}

fn spawn_registered(ctx: &AppContext, id: FeedId, geometry: watch::Receiver<CellGeometry>) -> FeedHandle {
    let registry = FeedRegistry::load(Arc::clone(&ctx.store));
    let feed = registry.get(id);
    spawn_feed(
        FeedSpec {
            label: id.display_name().to_owned(),
            url: feed.url.clone(),
            mode: feed.mode,
            timeout: ctx.config.connect_timeout(),
        },
        http_client(),
        Arc::clone(&ctx.log),
        geometry,
    )
}

/// Connects one feed, waits for its first frame and stores it.
pub async fn capture(ctx: &AppContext, args: CaptureArgs) -> Result<()> {
    let (_geometry_tx, geometry_rx) = watch::channel(CellGeometry::default());
    let handle = spawn_registered(ctx, args.feed, geometry_rx);
    let deadline = Instant::now() + ctx.config.connect_timeout() + CAPTURE_GRACE;
    wait_for_still(&handle, args.feed, deadline).await?;

    let image = handle.capture().await;
    let mut gallery = Gallery::load(Arc::clone(&ctx.store));
    let frame = gallery
        .add(args.feed.display_name(), &image)?
        .context("feed stopped showing a frame before it could be captured")?;
    let dir = args.out.unwrap_or_else(|| ctx.downloads_dir());
    let path = write_frame(&frame, &dir)?;
    println!(
        "Captured {}x{} frame {} -> {}",
        image.width,
        image.height,
        frame.id,
        path.display()
    );
    Ok(())
}

/// Polls until the feed has something to capture. An image stream reports
/// connected before its first frame is published, so only a decoded frame
/// counts; a connected video feed always yields a blank still.
async fn wait_for_still(handle: &FeedHandle, feed: FeedId, deadline: Instant) -> Result<()> {
    loop {
        let snapshot = handle.snapshot();
        if let Some(reason) = snapshot.state.failure() {
            bail!("{} feed failed: {reason}", feed.display_name());
        }
        if snapshot.frames_received > 0 {
            return Ok(());
        }
        if snapshot.state.is_connected() && snapshot.mode == DisplayMode::Video {
            return Ok(());
        }
        if Instant::now() >= deadline {
            if snapshot.state.is_connected() {
                bail!(
                    "{} feed is connected but showed no frame in {} mode",
                    feed.display_name(),
                    snapshot.mode
                );
            }
            bail!(
                "{} feed did not deliver a frame ({})",
                feed.display_name(),
                snapshot.state
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Keeps every active feed connected until Ctrl-C. State changes reach the
/// log through the activity log's tracing mirror.
pub async fn watch_feeds(ctx: &AppContext) -> Result<()> {
    let (_geometry_tx, geometry_rx) = watch::channel(CellGeometry::default());
    let registry = FeedRegistry::load(Arc::clone(&ctx.store));
    let ids: Vec<FeedId> = registry.active_feeds().map(|(id, _)| id).collect();
    if ids.is_empty() {
        bail!("no active feeds; enable one with `rescue-console feeds activate <feed>`");
    }

    let handles: Vec<(FeedId, FeedHandle)> = ids
        .into_iter()
        .map(|id| (id, spawn_registered(ctx, id, geometry_rx.clone())))
        .collect();
    info!(feeds = handles.len(), "watching active feeds, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(WATCH_POLL);
    let mut last_seen: Vec<u64> = vec![0; handles.len()];
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
            _ = ticker.tick() => {
                for ((id, handle), seen) in handles.iter().zip(last_seen.iter_mut()) {
                    let snapshot = handle.snapshot();
                    if snapshot.frames_received / 100 > *seen / 100 {
                        info!(feed = %id, frames = snapshot.frames_received, decode_errors = snapshot.decode_errors, "streaming");
                    }
                    *seen = snapshot.frames_received;
                }
            }
        }
    }

    for (id, handle) in &handles {
        let snapshot = handle.snapshot();
        println!(
            "{:<18}  {:<12}  frames={}",
            id.as_str(),
            snapshot.state.label(),
            snapshot.frames_received
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{capture, resolve_location};
    use crate::app::AppContext;
    use crate::capture::encode_jpeg;
    use crate::cli::{CaptureArgs, WeatherArgs};
    use crate::feeds::{DisplayMode, FeedId, FeedRegistry, FeedUpdate};
    use crate::gallery::Gallery;
    use image::{Rgb, RgbImage};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Multipart server that answers every request with two frames and then
    /// keeps the connection open.
    async fn mjpeg_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let image = RgbImage::from_fn(48, 32, |x, y| Rgb([(x * 5) as u8, (y * 7) as u8, 40]));
        let body = encode_jpeg(&image, 80).unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0_u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n")
                        .await;
                    for _ in 0..2 {
                        let mut part = format!(
                            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                            body.len()
                        )
                        .into_bytes();
                        part.extend_from_slice(&body);
                        part.extend_from_slice(b"\r\n");
                        let _ = socket.write_all(&part).await;
                    }
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });
        format!("http://{addr}/video_feed")
    }

    #[tokio::test]
    async fn capture_command_stores_a_frame_from_an_mjpeg_feed() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = AppContext::open(Some(tmp.path().join("data"))).unwrap();
        let url = mjpeg_server().await;
        let mut registry = FeedRegistry::load(Arc::clone(&ctx.store));
        registry.save(FeedId::Thermal, FeedUpdate::url(url)).unwrap();
        registry
            .save(FeedId::Thermal, FeedUpdate::mode(DisplayMode::Mjpeg))
            .unwrap();

        let out = tmp.path().join("stills");
        // Repeated runs cover the gap between the connect and the first frame.
        for round in 1..=5 {
            capture(
                &ctx,
                CaptureArgs {
                    feed: FeedId::Thermal,
                    out: Some(out.clone()),
                },
            )
            .await
            .unwrap();
            let gallery = Gallery::load(Arc::clone(&ctx.store));
            assert_eq!(gallery.len(), round);
            let jpeg = gallery.frames()[0].jpeg_bytes().unwrap();
            let still = image::load_from_memory(&jpeg).unwrap();
            assert_eq!((still.width(), still.height()), (48, 32));
        }
        assert!(std::fs::read_dir(&out).unwrap().count() >= 1);
    }

    fn args(location: Option<&str>, lat: Option<f64>, lon: Option<f64>) -> WeatherArgs {
        WeatherArgs {
            location: location.map(str::to_owned),
            lat,
            lon,
            json: false,
        }
    }

    #[test]
    fn location_defaults_to_first_preset() {
        let (name, lat, _) = resolve_location(&args(None, None, None)).unwrap();
        assert_eq!(name, "Bengaluru");
        assert!((lat - 12.9716).abs() < 1e-9);
    }

    #[test]
    fn coordinates_win_and_are_range_checked() {
        let (_, lat, lon) = resolve_location(&args(None, Some(-33.8688), Some(151.2093))).unwrap();
        assert!((lat + 33.8688).abs() < 1e-9);
        assert!((lon - 151.2093).abs() < 1e-9);
        assert!(resolve_location(&args(None, Some(95.0), Some(0.0))).is_err());
    }

    #[test]
    fn unknown_preset_lists_known_names() {
        let err = resolve_location(&args(Some("Atlantis"), None, None)).unwrap_err();
        assert!(err.to_string().contains("Tokyo"));
    }
}
