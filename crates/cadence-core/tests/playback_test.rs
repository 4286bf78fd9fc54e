//! Playback Integration Tests
//!
//! These tests drive the full player (read, decode and display threads plus a
//! real-time audio pull) over synthetic sources and check the state machine,
//! end-of-file draining, pacing, seeking and teardown.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --package cadence-core --test playback_test
//! ```
//!
//! For verbose player logs:
//! ```bash
//! RUST_LOG=cadence_core=debug cargo test --test playback_test -- --nocapture
//! ```

mod common;

use std::time::{Duration, Instant};

use cadence_core::{PlayerEvent, PlayerState, SyntheticAudio, SyntheticConfig};
use common::{collect_until, drain, states, wait_until, AudioClock, Harness};

fn av_source() -> SyntheticConfig {
    SyntheticConfig::default().with_audio(SyntheticAudio::new(48_000, 2))
}

#[test]
fn test_open_walks_through_preparation_states() {
    let h = Harness::new(av_source());
    assert_eq!(h.player.state(), PlayerState::Idle);
    h.open_ready("synthetic://states?duration=2");

    let events = drain(&h.events);
    let seen = states(&events);
    assert_eq!(
        seen[..4],
        [
            PlayerState::OpeningStream,
            PlayerState::PreparingTracks,
            PlayerState::Buffering,
            PlayerState::Suspended,
        ]
    );
    assert_eq!(seen.last(), Some(&PlayerState::Suspended));
    let opened = events
        .iter()
        .position(|e| matches!(e, PlayerEvent::StreamOpened));
    let ready = events
        .iter()
        .position(|e| matches!(e, PlayerEvent::TracksReady(_)));
    assert!(opened.is_some() && ready.is_some() && opened < ready);

    let Some(info) = h.player.media_info() else {
        panic!("Expected media info");
    };
    assert_eq!(info.duration, 2.0);
    assert_eq!(info.presentation_size, (64, 36));
    assert_eq!(info.fps, 25.0);
    assert_eq!(info.video_track, Some(0));
    assert_eq!(info.audio_track, Some(2));
    assert!(info.seek_enabled);

    h.player.play();
    assert!(h.wait_for_state(PlayerState::Playing));
    h.player.pause();
    assert!(h.wait_for_state(PlayerState::Suspended));
    h.player.close();
}

#[test]
fn test_preview_frame_is_shown_while_suspended() {
    let h = Harness::new(SyntheticConfig::default());
    h.open_ready("synthetic://preview?duration=2");

    assert!(wait_until(|| h.output.count() > 0));
    // Suspended playback keeps redrawing the first frame only
    assert!(wait_until(|| h.output.count() > 2));
    assert_eq!(h.output.distinct_positions(), vec![0.0]);
    assert_eq!(h.player.snapshot().progress, 0.0);
}

#[test]
fn test_end_of_file_waits_for_queues_to_drain() {
    let h = Harness::new(av_source());
    h.open_ready("synthetic://drain?duration=1");

    // The whole clip is demuxed while suspended, nothing is consumed
    assert!(wait_until(|| h.player.snapshot().end_of_file));
    let snapshot = h.player.snapshot();
    assert!(!snapshot.finished);
    assert!(snapshot.buffered_duration > 0.5);
    assert_eq!(h.player.state(), PlayerState::Suspended);

    let events = drain(&h.events);
    assert!(events.iter().any(|e| matches!(e, PlayerEvent::EndOfFile)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, PlayerEvent::PlaybackFinished)));

    let _clock = AudioClock::start(h.player.clone());
    h.player.play();
    let Some(seen) = collect_until(&h.events, |e| matches!(e, PlayerEvent::PlaybackFinished))
    else {
        panic!("Playback never finished");
    };
    assert!(seen
        .iter()
        .any(|e| matches!(e, PlayerEvent::BufferedDurationChanged(d) if *d == 0.0)));
    assert!(h.wait_for_state(PlayerState::Finished));

    let snapshot = h.player.snapshot();
    assert!(snapshot.finished);
    assert_eq!(snapshot.buffered_duration, 0.0);
    assert!(snapshot.progress > 0.9, "progress {}", snapshot.progress);
}

#[test]
fn test_video_only_is_paced_by_frame_duration() {
    let h = Harness::new(SyntheticConfig::default());
    h.open_ready("synthetic://pace?duration=1&fps=20");

    let started = Instant::now();
    h.player.play();
    assert!(h.wait_for_state(PlayerState::Finished));
    let elapsed = started.elapsed();

    // 20 frames of 50 ms each
    assert!(elapsed >= Duration::from_millis(800), "finished in {elapsed:?}");
    let positions = h.output.distinct_positions();
    assert_eq!(positions.len(), 20);
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    assert!((h.player.snapshot().progress - 0.95).abs() < 1e-6);
}

#[test]
fn test_video_follows_the_audio_clock() {
    let h = Harness::new(av_source());
    h.open_ready("synthetic://sync?duration=2&reorder=1&gop=10");

    let _clock = AudioClock::start(h.player.clone());
    let started = Instant::now();
    h.player.play();
    assert!(h.wait_for_state(PlayerState::Finished));
    assert!(started.elapsed() >= Duration::from_millis(1500));

    let positions = h.output.distinct_positions();
    assert!(positions.len() >= 40, "only {} frames shown", positions.len());
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));

    let metrics = h.player.sync_metrics();
    assert!(metrics.sample_count > 0);
    assert_eq!(metrics.discarded_count, 0);
    assert!(
        metrics.max_drift_ms() < 500,
        "max drift {} ms",
        metrics.max_drift_ms()
    );
    assert!(h.player.audio_handle().frames_rendered() > 0);
}

#[test]
fn test_output_is_silent_unless_playing() {
    let h = Harness::new(av_source());
    h.open_ready("synthetic://silent?duration=2");

    let mut buffer = vec![1.0f32; 256];
    assert_eq!(h.player.render_audio(&mut buffer, 2), 0);
    assert!(buffer.iter().all(|s| *s == 0.0));
    assert!(h.player.fetch_audio_frame().is_none());

    h.player.play();
    assert!(wait_until(|| h.player.render_audio(&mut buffer, 2) > 0));
    assert!(buffer.iter().any(|s| *s != 0.0));

    h.player.audio_handle().set_muted(true);
    h.player.render_audio(&mut buffer, 2);
    assert!(buffer.iter().all(|s| *s == 0.0));
}

#[test]
fn test_seek_targets_are_clamped() {
    let h = Harness::new(av_source());
    h.open_ready("synthetic://clamp?duration=30");
    let stats = h.backend.stats();

    // 30 s - (0 s minimum buffer + 8 s lookahead with audio)
    h.player.seek(29.0);
    assert_eq!(h.player.snapshot().progress, 22.0);
    assert!(wait_until(|| stats.seeks() == 1));
    assert_eq!(stats.last_seek(), Some(22.0));
    assert!(h.wait_for_state(PlayerState::Suspended));

    h.player.seek(-5.0);
    assert!(wait_until(|| stats.seeks() == 2));
    assert_eq!(stats.last_seek(), Some(0.0));
    assert!(h.wait_for_state(PlayerState::Suspended));

    let seen = states(&drain(&h.events));
    assert!(seen.contains(&PlayerState::Seeking));
    assert!(seen.contains(&PlayerState::Buffering));
}

#[test]
fn test_video_only_seek_uses_longer_lookahead() {
    let h = Harness::new(SyntheticConfig::default());
    h.open_ready("synthetic://clamp?duration=30");

    h.player.seek(29.0);
    assert_eq!(h.player.snapshot().progress, 15.0);
    assert!(h.wait_for_state(PlayerState::Suspended));
    // The preview follows the seek: keyframe at 15 s with a 1 s GOP
    assert!(wait_until(|| h.output.distinct_positions().last() == Some(&15.0)));
}

#[test]
fn test_play_after_finish_restarts_from_the_beginning() {
    let h = Harness::new(SyntheticConfig::default());
    h.open_ready("synthetic://again?duration=0.4");

    h.player.play();
    assert!(h.wait_for_state(PlayerState::Finished));
    let first_pass = h.output.distinct_positions().len();
    drain(&h.events);

    // Every loop exited at end of file; play must bring them back
    h.player.play();
    let Some(seen) = collect_until(&h.events, |e| matches!(e, PlayerEvent::PlaybackFinished))
    else {
        panic!("Second pass never finished");
    };
    assert!(states(&seen).contains(&PlayerState::Seeking));
    assert!(h.output.distinct_positions().len() > first_pass);
    assert_eq!(h.backend.stats().last_seek(), Some(0.0));
}

#[test]
fn test_seek_after_end_of_file_resumes_playback() {
    let h = Harness::new(av_source());
    h.open_ready("synthetic://reseek?duration=1");
    let _clock = AudioClock::start(h.player.clone());
    h.player.play();
    assert!(h.wait_for_state(PlayerState::Finished));

    h.player.seek(0.5);
    // Clamped to the seek floor: 1 s is shorter than the lookahead
    assert_eq!(h.player.snapshot().progress, 0.0);
    assert!(wait_until(|| h.player.state() != PlayerState::Finished));
    assert!(h.wait_for_state(PlayerState::Finished));
    assert_eq!(h.backend.stats().seeks(), 1);
}

#[test]
fn test_buffering_threshold_holds_playback() {
    let source = av_source().with_read_delay(Duration::from_millis(5));
    let h = Harness::new(source);
    h.player.set_min_buffered_duration(1.0);
    if let Err(err) = h.player.open("synthetic://slow?duration=3") {
        panic!("open failed: {err}");
    }
    h.player.play();

    assert!(h.wait_for_state(PlayerState::Buffering));
    assert!(h.wait_for_state(PlayerState::Playing));
    let snapshot = h.player.snapshot();
    assert!(snapshot.buffered_duration >= 1.0 || snapshot.end_of_file);
    assert!(snapshot.playable_time >= snapshot.progress);
}

#[test]
fn test_close_tears_everything_down() {
    let h = Harness::new(av_source());
    h.open_ready("synthetic://close?duration=5");
    let clock = AudioClock::start(h.player.clone());
    h.player.play();
    assert!(wait_until(|| h.player.snapshot().progress > 0.1));

    h.player.close();
    drop(clock);
    assert_eq!(h.player.state(), PlayerState::Closed);
    assert!(!h.player.audio_handle().is_available());
    let events = drain(&h.events);
    assert_eq!(states(&events).last(), Some(&PlayerState::Closed));

    // Closed players ignore everything
    h.player.close();
    h.player.play();
    h.player.seek(1.0);
    assert_eq!(h.player.state(), PlayerState::Closed);
    let mut buffer = vec![1.0f32; 64];
    assert_eq!(h.player.render_audio(&mut buffer, 2), 0);
    assert!(h.player.open("synthetic://close").is_err());
    assert!(drain(&h.events).is_empty());
}

#[test]
fn test_close_while_opening() {
    let h = Harness::new(av_source().with_read_delay(Duration::from_millis(20)));
    if let Err(err) = h.player.open("synthetic://early") {
        panic!("open failed: {err}");
    }
    h.player.close();
    assert_eq!(h.player.state(), PlayerState::Closed);
}

#[test]
fn test_lifecycle_events_survive_an_undrained_queue() {
    let h = Harness::new(av_source());
    h.open_ready("synthetic://backlog?duration=600");
    let clock = AudioClock::start(h.player.clone());
    h.player.play();
    assert!(h.wait_for_state(PlayerState::Playing));

    // Nobody reads events while progress and buffer updates pile up
    std::thread::sleep(Duration::from_millis(1500));
    h.player.pause();
    assert!(h.wait_for_state(PlayerState::Suspended));
    h.player.play();
    assert!(h.wait_for_state(PlayerState::Playing));
    drop(clock);

    let events = drain(&h.events);
    let seen = states(&events);
    let playing = seen.iter().filter(|s| **s == PlayerState::Playing).count();
    assert!(playing >= 2, "states seen: {seen:?}");
    assert_eq!(seen.last(), Some(&PlayerState::Playing));
    assert!(events.iter().any(|e| matches!(
        e,
        PlayerEvent::StateChanged {
            previous: PlayerState::Suspended,
            current: PlayerState::Playing
        }
    )));
}
