//! Voice turn-loop integration tests
//!
//! Everything runs against mock devices and backends; the assertions
//! cover the turn lifecycle, cancellation, failure policies, and the
//! one-open-handle rule.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{MockDialogue, MockMicrophone, MockSpeaker, MockSynthesizer, MockTranscriber};
use skald::audio::{Microphone, Speaker};
use skald::clients::{Dialogue, Synthesizer, Transcriber};
use skald::{FailurePolicy, Notice, Phase, SessionStore, VoiceOrchestrator, VoicePolicy};
use tokio::sync::watch;

/// A capture window long enough that only `finish_capture` ends it
fn test_policy(failure: FailurePolicy) -> VoicePolicy {
    VoicePolicy {
        capture_window: Duration::from_secs(60),
        settle_delay: Duration::ZERO,
        failure,
    }
}

struct Rig {
    mic: Arc<MockMicrophone>,
    speaker: Arc<MockSpeaker>,
    dialogue: Arc<MockDialogue>,
    synthesizer: Arc<MockSynthesizer>,
    sessions: Arc<SessionStore>,
    voice: Arc<VoiceOrchestrator>,
}

fn rig(
    transcriber: MockTranscriber,
    dialogue: MockDialogue,
    speaker: MockSpeaker,
    synthesizer: MockSynthesizer,
    failure: FailurePolicy,
) -> Rig {
    rig_with_policy(transcriber, dialogue, speaker, synthesizer, test_policy(failure))
}

fn rig_with_policy(
    transcriber: MockTranscriber,
    dialogue: MockDialogue,
    speaker: MockSpeaker,
    synthesizer: MockSynthesizer,
    policy: VoicePolicy,
) -> Rig {
    let mic = Arc::new(MockMicrophone::new());
    let speaker = Arc::new(speaker);
    let dialogue = Arc::new(dialogue);
    let synthesizer = Arc::new(synthesizer);
    let sessions = Arc::new(SessionStore::in_memory());

    let voice = VoiceOrchestrator::builder(
        Arc::clone(&mic) as Arc<dyn Microphone>,
        Arc::clone(&speaker) as Arc<dyn Speaker>,
        Arc::new(transcriber) as Arc<dyn Transcriber>,
        Arc::clone(&dialogue) as Arc<dyn Dialogue>,
        Arc::clone(&synthesizer) as Arc<dyn Synthesizer>,
        Arc::clone(&sessions),
    )
    .policy(policy)
    .build();

    Rig {
        mic,
        speaker,
        dialogue,
        synthesizer,
        sessions,
        voice,
    }
}

fn happy_rig() -> Rig {
    rig(
        MockTranscriber::returning("what time is it"),
        MockDialogue::replying("half past nine"),
        MockSpeaker::new(),
        MockSynthesizer::new(),
        FailurePolicy::KeepListening,
    )
}

/// Let the spawned turn loop reach its capture select
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn wait_for_phase(rx: &mut watch::Receiver<Phase>, want: Phase) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| *p == want))
        .await
        .expect("timed out waiting for phase")
        .expect("orchestrator gone");
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never reached");
}

#[tokio::test]
async fn voice_turn_appends_user_and_assistant_messages() {
    let r = happy_rig();

    r.voice.enable().unwrap();
    settle().await;
    r.voice.finish_capture();

    // The turn is over once the next capture window opens
    wait_until(|| r.mic.stats.opens.load(Ordering::SeqCst) == 2).await;
    assert_eq!(r.voice.phase(), Phase::Capturing);
    r.voice.disable();

    let messages = r.sessions.active_session().messages;
    assert_eq!(messages.len(), 3); // welcome + user + assistant
    assert_eq!(messages[1].text, "what time is it");
    assert_eq!(messages[2].text, "half past nine");
    assert_eq!(r.synthesizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(r.speaker.stats.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn enable_is_a_noop_when_already_on() {
    let r = happy_rig();

    r.voice.enable().unwrap();
    r.voice.enable().unwrap();

    assert_eq!(r.mic.stats.opens.load(Ordering::SeqCst), 1);
    assert_eq!(r.voice.phase(), Phase::Capturing);
    r.voice.disable();
}

#[tokio::test]
async fn disable_when_idle_changes_nothing() {
    let r = happy_rig();

    r.voice.disable();
    assert_eq!(r.voice.phase(), Phase::Idle);
    assert!(!r.voice.is_active());

    // And voice mode still comes up cleanly afterwards
    r.voice.enable().unwrap();
    assert!(r.voice.is_active());
    r.voice.disable();
    r.voice.disable();
    assert_eq!(r.voice.phase(), Phase::Idle);
}

#[tokio::test]
async fn denied_microphone_stays_idle() {
    let r = happy_rig();
    r.mic.deny();

    assert!(r.voice.enable().is_err());
    assert_eq!(r.voice.phase(), Phase::Idle);
    assert_eq!(r.mic.stats.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reply_arriving_after_disable_is_dropped() {
    let (dialogue, gate) = MockDialogue::gated("too late");
    let r = rig(
        MockTranscriber::returning("hello there"),
        dialogue,
        MockSpeaker::new(),
        MockSynthesizer::new(),
        FailurePolicy::KeepListening,
    );

    r.voice.enable().unwrap();
    settle().await;
    r.voice.finish_capture();

    // The turn is now parked inside the dialogue call
    wait_until(|| r.dialogue.sent_count() == 1).await;
    r.voice.disable();
    let _ = gate.send(());
    settle().await;

    let messages = r.sessions.active_session().messages;
    assert_eq!(messages.len(), 2); // welcome + user; the reply went stale
    assert_eq!(messages[1].text, "hello there");
    assert_eq!(r.voice.phase(), Phase::Idle);
    assert_eq!(r.synthesizer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(r.speaker.stats.opens.load(Ordering::SeqCst), 0);
    assert_eq!(r.mic.stats.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disable_mid_speaking_releases_playback() {
    let r = rig(
        MockTranscriber::returning("say something long"),
        MockDialogue::replying("an endless reply"),
        MockSpeaker::holding(),
        MockSynthesizer::new(),
        FailurePolicy::KeepListening,
    );
    let mut phases = r.voice.watch_phase();

    r.voice.enable().unwrap();
    settle().await;
    r.voice.finish_capture();
    wait_for_phase(&mut phases, Phase::Speaking).await;
    assert_eq!(r.speaker.stats.live.load(Ordering::SeqCst), 1);

    r.voice.disable();
    settle().await;

    assert_eq!(r.voice.phase(), Phase::Idle);
    assert_eq!(r.speaker.stats.live.load(Ordering::SeqCst), 0);
    assert_eq!(r.mic.stats.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn silence_is_discarded_and_capture_reopens() {
    let r = rig(
        MockTranscriber::returning("   "),
        MockDialogue::replying("never sent"),
        MockSpeaker::new(),
        MockSynthesizer::new(),
        FailurePolicy::KeepListening,
    );

    r.voice.enable().unwrap();
    settle().await;
    r.voice.finish_capture();

    wait_until(|| r.mic.stats.opens.load(Ordering::SeqCst) == 2).await;
    assert_eq!(r.voice.phase(), Phase::Capturing);
    assert_eq!(r.dialogue.sent_count(), 0);
    assert_eq!(r.sessions.active_session().messages.len(), 1); // welcome only
    r.voice.disable();
}

#[tokio::test]
async fn transcription_failure_behaves_like_silence() {
    let r = rig(
        MockTranscriber::returning("fine now").then(Err("whisper 500")),
        MockDialogue::replying("unused"),
        MockSpeaker::new(),
        MockSynthesizer::new(),
        FailurePolicy::KeepListening,
    );
    let mut notices = r.voice.take_notices().unwrap();

    r.voice.enable().unwrap();
    settle().await;
    r.voice.finish_capture();

    wait_until(|| r.mic.stats.opens.load(Ordering::SeqCst) == 2).await;
    assert_eq!(r.voice.phase(), Phase::Capturing);
    assert_eq!(r.dialogue.sent_count(), 0);

    let notice = notices.recv().await.unwrap();
    assert!(matches!(notice, Notice::TranscriptionFailed(_)));
    r.voice.disable();
}

#[tokio::test]
async fn dialogue_failure_keeps_listening_with_error_entry() {
    let r = rig(
        MockTranscriber::returning("hello"),
        MockDialogue::failing(),
        MockSpeaker::new(),
        MockSynthesizer::new(),
        FailurePolicy::KeepListening,
    );
    let mut notices = r.voice.take_notices().unwrap();

    r.voice.enable().unwrap();
    settle().await;
    r.voice.finish_capture();

    wait_until(|| r.mic.stats.opens.load(Ordering::SeqCst) == 2).await;
    assert_eq!(r.voice.phase(), Phase::Capturing);

    let messages = r.sessions.active_session().messages;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].text, "hello");
    assert!(messages[2].text.starts_with("Sorry"));

    let notice = notices.recv().await.unwrap();
    assert!(matches!(notice, Notice::DialogueFailed(_)));
    assert_eq!(r.speaker.stats.opens.load(Ordering::SeqCst), 0);
    r.voice.disable();
}

#[tokio::test]
async fn dialogue_failure_exits_under_exit_policy() {
    let r = rig(
        MockTranscriber::returning("hello"),
        MockDialogue::failing(),
        MockSpeaker::new(),
        MockSynthesizer::new(),
        FailurePolicy::ExitVoiceMode,
    );

    r.voice.enable().unwrap();
    settle().await;
    r.voice.finish_capture();

    wait_until(|| r.voice.phase() == Phase::Idle).await;
    assert_eq!(r.mic.stats.live.load(Ordering::SeqCst), 0);
    assert_eq!(r.mic.stats.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn synthesis_failure_keeps_the_reply_in_the_transcript() {
    let r = rig(
        MockTranscriber::returning("hello"),
        MockDialogue::replying("a fine reply"),
        MockSpeaker::new(),
        MockSynthesizer::failing(),
        FailurePolicy::KeepListening,
    );
    let mut notices = r.voice.take_notices().unwrap();

    r.voice.enable().unwrap();
    settle().await;
    r.voice.finish_capture();

    wait_until(|| r.mic.stats.opens.load(Ordering::SeqCst) == 2).await;

    let messages = r.sessions.active_session().messages;
    assert_eq!(messages[2].text, "a fine reply");
    assert_eq!(r.speaker.stats.opens.load(Ordering::SeqCst), 0);

    let notice = notices.recv().await.unwrap();
    assert!(matches!(notice, Notice::SynthesisFailed(_)));
    r.voice.disable();
}

#[tokio::test]
async fn at_most_one_capture_and_playback_open() {
    let r = happy_rig();

    r.voice.enable().unwrap();
    for turn in 1..=3 {
        wait_until(|| {
            r.voice.phase() == Phase::Capturing
                && r.mic.stats.opens.load(Ordering::SeqCst) == turn
        })
        .await;
        settle().await;
        r.voice.finish_capture();
    }
    wait_until(|| r.mic.stats.opens.load(Ordering::SeqCst) == 4).await;
    r.voice.disable();

    assert_eq!(r.mic.stats.max_live.load(Ordering::SeqCst), 1);
    assert_eq!(r.speaker.stats.max_live.load(Ordering::SeqCst), 1);
    assert_eq!(r.mic.stats.live.load(Ordering::SeqCst), 0);
    assert_eq!(r.speaker.stats.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn speak_reply_plays_only_while_capturing() {
    let r = happy_rig();

    // Idle: nothing to do, nothing played
    r.voice.speak_reply("ignored").await.unwrap();
    assert_eq!(r.speaker.stats.opens.load(Ordering::SeqCst), 0);

    r.voice.enable().unwrap();
    settle().await;
    r.voice.speak_reply("spoken").await.unwrap();
    assert_eq!(r.speaker.stats.opens.load(Ordering::SeqCst), 1);
    assert_eq!(r.speaker.stats.live.load(Ordering::SeqCst), 0);
    assert_eq!(r.voice.phase(), Phase::Capturing);
    r.voice.disable();
}

#[tokio::test]
async fn typed_reply_playback_does_not_clobber_a_turn() {
    let r = rig_with_policy(
        MockTranscriber::returning("what now"),
        MockDialogue::replying("turn reply"),
        MockSpeaker::holding(),
        MockSynthesizer::new(),
        VoicePolicy {
            capture_window: Duration::from_millis(200),
            settle_delay: Duration::ZERO,
            failure: FailurePolicy::KeepListening,
        },
    );

    r.voice.enable().unwrap();
    settle().await;

    // A typed reply starts playing while the mic is still capturing
    let voice = Arc::clone(&r.voice);
    let typed = tokio::spawn(async move { voice.speak_reply("typed reply").await });
    wait_until(|| r.speaker.stats.opens.load(Ordering::SeqCst) == 1).await;

    // The capture window elapses mid-playback; the turn runs and takes
    // over the speaker, which resolves the typed playback early
    wait_until(|| r.speaker.stats.opens.load(Ordering::SeqCst) == 2).await;
    typed.await.unwrap().unwrap();
    settle().await;

    // The turn's clip must still be playing and the mic must stay closed
    assert_eq!(r.voice.phase(), Phase::Speaking);
    assert_eq!(r.speaker.stats.live.load(Ordering::SeqCst), 1);
    assert_eq!(r.mic.stats.opens.load(Ordering::SeqCst), 1);

    r.voice.disable();
    settle().await;
    assert_eq!(r.speaker.stats.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn capture_ceiling_ends_a_silent_window_on_its_own() {
    let r = rig_with_policy(
        MockTranscriber::returning(""),
        MockDialogue::replying("never sent"),
        MockSpeaker::new(),
        MockSynthesizer::new(),
        VoicePolicy {
            capture_window: Duration::from_millis(100),
            settle_delay: Duration::ZERO,
            failure: FailurePolicy::KeepListening,
        },
    );

    r.voice.enable().unwrap();

    // No finish_capture: the window ceiling alone must recycle the mic
    wait_until(|| r.mic.stats.opens.load(Ordering::SeqCst) >= 3).await;
    r.voice.disable();

    assert_eq!(r.dialogue.sent_count(), 0);
    assert_eq!(r.sessions.active_session().messages.len(), 1); // welcome only
    assert_eq!(r.mic.stats.max_live.load(Ordering::SeqCst), 1);
    assert_eq!(r.mic.stats.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disable_during_settle_does_not_reopen_capture() {
    let r = rig_with_policy(
        MockTranscriber::returning("hello"),
        MockDialogue::replying("hi"),
        MockSpeaker::new(),
        MockSynthesizer::new(),
        VoicePolicy {
            capture_window: Duration::from_secs(60),
            settle_delay: Duration::from_millis(200),
            failure: FailurePolicy::KeepListening,
        },
    );

    r.voice.enable().unwrap();
    settle().await;
    r.voice.finish_capture();

    // Reply played; the loop is now waiting out the settle delay
    wait_until(|| r.speaker.stats.opens.load(Ordering::SeqCst) == 1).await;
    r.voice.disable();

    // Let the settle timer fire; it must find the epoch stale
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(r.mic.stats.opens.load(Ordering::SeqCst), 1);
    assert_eq!(r.voice.phase(), Phase::Idle);
    assert_eq!(r.mic.stats.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fallback_transcriber_covers_primary_failure() {
    let mic = Arc::new(MockMicrophone::new());
    let speaker = Arc::new(MockSpeaker::new());
    let dialogue = Arc::new(MockDialogue::replying("heard you"));
    let sessions = Arc::new(SessionStore::in_memory());

    let voice = VoiceOrchestrator::builder(
        Arc::clone(&mic) as Arc<dyn Microphone>,
        Arc::clone(&speaker) as Arc<dyn Speaker>,
        Arc::new(MockTranscriber::failing()) as Arc<dyn Transcriber>,
        Arc::clone(&dialogue) as Arc<dyn Dialogue>,
        Arc::new(MockSynthesizer::new()) as Arc<dyn Synthesizer>,
        Arc::clone(&sessions),
    )
    .policy(test_policy(FailurePolicy::KeepListening))
    .fallback_transcriber(Arc::new(MockTranscriber::returning("from fallback")))
    .build();

    voice.enable().unwrap();
    settle().await;
    voice.finish_capture();

    wait_until(|| dialogue.sent_count() == 1).await;
    let (utterance, _) = dialogue.sent.lock().unwrap()[0].clone();
    assert_eq!(utterance, "from fallback");
    voice.disable();
}
