// Agent event decoding
//
// The agent reports notifications in composite event packets. Each event is
// decoded straight into a `NativeEvent`; the target stays stopped until the
// session decides to continue it.

use super::commands::event_kinds;
use super::reader::{read_i32, read_module, read_option, read_u32, read_u64, read_u8, read_value};
use crate::error::{NativeError, NativeResult};
use crate::native::{ExceptionStage, NativeEvent, StepCompleteReason};
use crate::types::{EvalId, ModuleId, NativeBreakpointId};

/// Parse the payload of an event packet
pub fn parse_event_packet(data: &[u8]) -> NativeResult<Vec<NativeEvent>> {
    let mut buf = data;

    let event_count = read_i32(&mut buf)?;
    if event_count < 0 {
        return Err(NativeError::Protocol(format!("Invalid event count: {}", event_count)));
    }

    let mut events = Vec::with_capacity(event_count as usize);
    for _ in 0..event_count {
        let kind = read_u8(&mut buf)?;
        let event = match kind {
            event_kinds::PROCESS_CREATED => NativeEvent::ProcessCreated {
                pid: read_u32(&mut buf)?,
            },
            event_kinds::PROCESS_EXITED => NativeEvent::ProcessExited {
                exit_code: read_i32(&mut buf)?,
            },
            event_kinds::DOMAIN_CREATED => NativeEvent::DomainCreated,
            event_kinds::THREAD_CREATED => NativeEvent::ThreadCreated {
                thread: read_u32(&mut buf)?,
            },
            event_kinds::THREAD_EXITED => NativeEvent::ThreadExited {
                thread: read_u32(&mut buf)?,
            },
            event_kinds::MODULE_LOADED => NativeEvent::ModuleLoaded {
                module: read_module(&mut buf)?,
            },
            event_kinds::MODULE_UNLOADED => NativeEvent::ModuleUnloaded {
                module: ModuleId(read_u64(&mut buf)?),
            },
            event_kinds::BREAKPOINT => NativeEvent::BreakpointHit {
                thread: read_u32(&mut buf)?,
                breakpoint: NativeBreakpointId(read_u32(&mut buf)?),
            },
            event_kinds::STEP_COMPLETE => NativeEvent::StepComplete {
                thread: read_u32(&mut buf)?,
                reason: step_reason(read_u8(&mut buf)?)?,
            },
            event_kinds::BREAK => NativeEvent::Break {
                thread: read_u32(&mut buf)?,
            },
            event_kinds::EXCEPTION => NativeEvent::Exception {
                thread: read_u32(&mut buf)?,
                stage: exception_stage(read_u8(&mut buf)?)?,
                exception: read_value(&mut buf)?,
            },
            event_kinds::EVAL_COMPLETE => NativeEvent::EvalComplete {
                thread: read_u32(&mut buf)?,
                eval: EvalId(read_u64(&mut buf)?),
                result: read_option(&mut buf, read_value)?,
            },
            event_kinds::EVAL_EXCEPTION => NativeEvent::EvalException {
                thread: read_u32(&mut buf)?,
                eval: EvalId(read_u64(&mut buf)?),
                exception: read_value(&mut buf)?,
            },
            // payload length is unknown, the rest of the packet is lost
            other => {
                return Err(NativeError::Protocol(format!("Unsupported event kind: {}", other)));
            }
        };
        events.push(event);
    }

    Ok(events)
}

fn step_reason(code: u8) -> NativeResult<StepCompleteReason> {
    Ok(match code {
        0 => StepCompleteReason::Normal,
        1 => StepCompleteReason::Return,
        2 => StepCompleteReason::Call,
        3 => StepCompleteReason::Exception,
        4 => StepCompleteReason::Intercept,
        5 => StepCompleteReason::Exit,
        other => return Err(NativeError::Protocol(format!("Invalid step reason: {}", other))),
    })
}

fn exception_stage(code: u8) -> NativeResult<ExceptionStage> {
    Ok(match code {
        1 => ExceptionStage::FirstChance,
        2 => ExceptionStage::UserFirstChance,
        3 => ExceptionStage::CatchHandlerFound,
        4 => ExceptionStage::Unhandled,
        other => return Err(NativeError::Protocol(format!("Invalid exception stage: {}", other))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::commands::value_tags;
    use crate::agent::reader::put_string;
    use bytes::BufMut;

    #[test]
    fn test_parse_composite_event() {
        let mut data = Vec::new();
        data.put_i32(3);
        data.put_u8(event_kinds::BREAKPOINT);
        data.put_u32(7);
        data.put_u32(2);
        data.put_u8(event_kinds::EVAL_COMPLETE);
        data.put_u32(7);
        data.put_u64(11);
        data.put_u8(0);
        data.put_u8(event_kinds::EXCEPTION);
        data.put_u32(7);
        data.put_u8(4);
        data.put_u64(99);
        data.put_u8(value_tags::OBJECT);
        put_string(&mut data, "System.InvalidOperationException");

        let events = parse_event_packet(&data).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0],
            NativeEvent::BreakpointHit {
                thread: 7,
                breakpoint: NativeBreakpointId(2)
            }
        ));
        assert!(matches!(
            events[1],
            NativeEvent::EvalComplete {
                eval: EvalId(11),
                result: None,
                ..
            }
        ));
        match &events[2] {
            NativeEvent::Exception { stage, exception, .. } => {
                assert_eq!(*stage, ExceptionStage::Unhandled);
                assert_eq!(exception.type_name, "System.InvalidOperationException");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_kind_fails() {
        let mut data = Vec::new();
        data.put_i32(1);
        data.put_u8(200);
        assert!(parse_event_packet(&data).is_err());
    }
}
