//! The universal call engine: run `f(arg)` on a hijacked thread.
//!
//! A call never creates a thread. The engine captures the suspended thread's
//! full register context, rewrites instruction pointer, argument register,
//! and stack so that on resume the thread executes exactly one call whose
//! return address is a two-byte self-jump gadget (the *halt point*), then
//! polls the thread's context until the instruction pointer parks on the
//! gadget. The return register is harvested and the saved context is
//! restored verbatim, so the target thread resumes its original work as if
//! nothing happened.
//!
//! The halt mechanism is a deliberate choice among the alternatives (trap
//! instruction, OS wait primitive): a self-jump plus context polling needs no
//! extra handles and no debugger attachment. Polling granularity and the
//! overall ceiling come from [`EngineConfig`](crate::EngineConfig).

/// A remote function address plus exactly one machine-word argument.
///
/// Transient: built immediately before a universal call and discarded after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDescriptor {
    /// Address of the function inside the target's address space.
    pub function: usize,
    /// Sole argument, typically an address previously pushed into the target.
    pub argument: usize,
}

impl CallDescriptor {
    /// Builds a descriptor for `function(argument)`.
    pub fn new(function: usize, argument: usize) -> Self {
        Self { function, argument }
    }
}

/// Scratch distance kept below the target's current stack pointer so the
/// fabricated frame cannot clobber red-zone or leaf-function spill data.
pub(crate) const STACK_HEADROOM: u64 = 0x200;

/// New stack pointer for the fabricated x86_64 frame.
///
/// The x64 convention wants `rsp % 16 == 8` at function entry (the call
/// instruction's pushed return address accounts for the 8); dropping 0x28
/// below a 16-byte boundary leaves that alignment plus the 0x20-byte shadow
/// space the callee may spill into.
pub(crate) fn x64_frame(rsp: u64) -> u64 {
    ((rsp - STACK_HEADROOM) & !0xF) - 0x28
}

/// New stack pointer for the fabricated x86 frame: return address at
/// `[esp]`, the stdcall argument at `[esp + 4]`.
pub(crate) fn x86_frame(esp: u32) -> u32 {
    ((esp - STACK_HEADROOM as u32) & !0x3) - 8
}

#[cfg(windows)]
mod windows_impl {
    use std::time::Instant;

    #[cfg(target_arch = "x86_64")]
    use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_FULL_AMD64 as CONTEXT_FULL;
    #[cfg(target_arch = "x86")]
    use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_FULL_X86 as CONTEXT_FULL;
    use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT;

    use super::CallDescriptor;
    use crate::session::Session;
    use crate::{debug, info, warn, Error, Result};

    #[cfg(target_arch = "x86_64")]
    fn instruction_pointer(context: &CONTEXT) -> usize {
        context.Rip as usize
    }
    #[cfg(target_arch = "x86")]
    fn instruction_pointer(context: &CONTEXT) -> usize {
        context.Eip as usize
    }

    #[cfg(target_arch = "x86_64")]
    fn stack_pointer(context: &CONTEXT) -> usize {
        context.Rsp as usize
    }
    #[cfg(target_arch = "x86")]
    fn stack_pointer(context: &CONTEXT) -> usize {
        context.Esp as usize
    }

    #[cfg(target_arch = "x86_64")]
    fn return_value(context: &CONTEXT) -> usize {
        context.Rax as usize
    }
    #[cfg(target_arch = "x86")]
    fn return_value(context: &CONTEXT) -> usize {
        context.Eax as usize
    }

    /// Sanity check on a captured context. A context with a missing flag set
    /// or a zero instruction/stack pointer would be restored into garbage.
    fn validate(context: &CONTEXT) -> Result<()> {
        if context.ContextFlags & CONTEXT_FULL != CONTEXT_FULL
            || instruction_pointer(context) == 0
            || stack_pointer(context) == 0
        {
            return Err(Error::ContextCorrupt);
        }
        Ok(())
    }

    impl Session {
        /// Executes `call.function(call.argument)` on the hijacked thread and
        /// returns the machine-word result.
        ///
        /// Requires the session to be `Attached`; the state machine forbids
        /// concurrent calls. On [`Error::Timeout`], [`Error::TargetGone`], or
        /// [`Error::ContextCorrupt`] the session moves to `Failed` and the
        /// only remaining operation is teardown.
        pub fn invoke(&mut self, call: &CallDescriptor) -> Result<usize> {
            use crate::session::State;
            match self.state {
                State::Attached => {}
                _ => return Err(Error::Execution("session is not attached".into())),
            }
            self.state = State::Executing;

            let outcome = self.invoke_parked(call);
            match &outcome {
                Err(err) if err.is_fatal() => self.mark_failed(),
                _ => self.state = State::Attached,
            }
            outcome
        }

        /// The call proper. Entered and left with the thread suspended.
        fn invoke_parked(&mut self, call: &CallDescriptor) -> Result<usize> {
            let halt = {
                let (_, stack) = self.stack_parts()?;
                stack.halt_addr()
            };

            // Step 1: capture the context restored at the end regardless of
            // outcome.
            let saved = self.thread().context()?;
            validate(&saved)?;

            // Step 2: fabricate the calling state. The return address points
            // at the halt gadget, never back into the thread's own work.
            let mut hijacked = saved;

            #[cfg(target_arch = "x86_64")]
            {
                let frame = super::x64_frame(saved.Rsp);
                self.process().write(frame as usize, &(halt as u64).to_le_bytes())?;
                hijacked.Rip = call.function as u64;
                hijacked.Rcx = call.argument as u64;
                hijacked.Rsp = frame;
            }

            #[cfg(target_arch = "x86")]
            {
                let frame = super::x86_frame(saved.Esp);
                let mut slots = [0u8; 8];
                slots[..4].copy_from_slice(&(halt as u32).to_le_bytes());
                slots[4..].copy_from_slice(&(call.argument as u32).to_le_bytes());
                self.process().write(frame as usize, &slots)?;
                hijacked.Eip = call.function as u32;
                hijacked.Esp = frame;
            }

            debug!(
                function = call.function,
                argument = call.argument,
                halt,
                "dispatching universal call"
            );
            self.thread().set_context(&hijacked)?;

            // The fabricated context is installed from here on: every failure
            // path must attempt a restore and surface as fatal, so the session
            // can never return to `Attached` with the hijack still live.
            if self.thread().resume().is_err() {
                let _ = self.thread().set_context(&saved);
                return Err(Error::TargetGone);
            }

            // Step 3: run until the halt point, bounded by the ceiling.
            let deadline = Instant::now() + self.config.call_timeout;

            loop {
                std::thread::sleep(self.config.poll_interval);

                // Park the thread while its context is inspected.
                if self.thread().suspend().is_err() {
                    return Err(Error::TargetGone);
                }
                let current = match self.thread().context() {
                    Ok(context) => context,
                    Err(err) => {
                        warn!(%err, "context read failed mid-call");
                        let _ = self.thread().set_context(&saved);
                        return Err(Error::TargetGone);
                    }
                };

                if instruction_pointer(&current) == halt {
                    // Steps 4 and 5: harvest the result, restore the saved
                    // context verbatim, leave the thread parked.
                    let result = return_value(&current);
                    self.thread()
                        .set_context(&saved)
                        .map_err(|_| Error::ContextCorrupt)?;
                    info!(result, "universal call completed");
                    return Ok(result);
                }

                if Instant::now() >= deadline {
                    // Best-effort restore; the session is lost either way.
                    let _ = self.thread().set_context(&saved);
                    warn!("halt point not reached within the ceiling");
                    return Err(Error::Timeout);
                }

                if self.thread().resume().is_err() {
                    let _ = self.thread().set_context(&saved);
                    return Err(Error::TargetGone);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x64_frames_are_call_aligned() {
        for rsp in [0x7ffe_0000_u64, 0x7ffe_0008, 0x7ffe_000f, 0x14_fe38] {
            let frame = x64_frame(rsp);
            assert_eq!(frame % 16, 8, "entry rsp must be 8 mod 16 for rsp {rsp:#x}");
            assert!(frame <= rsp - STACK_HEADROOM);
        }
    }

    #[test]
    fn x86_frames_hold_return_address_and_argument() {
        let esp = 0x0019_ff74_u32;
        let frame = x86_frame(esp);
        assert_eq!(frame % 4, 0);
        assert!(frame <= esp - STACK_HEADROOM as u32);
    }

    #[test]
    fn descriptor_is_a_plain_value() {
        let call = CallDescriptor::new(0xdead_0000, 0xbeef_0000);
        assert_eq!(call.function, 0xdead_0000);
        assert_eq!(call.argument, 0xbeef_0000);
    }
}

#[cfg(all(test, windows))]
mod live_tests {
    use std::time::Duration;

    use crate::session::live_tests::Victim;
    use crate::{CallDescriptor, Engine, EngineConfig, Error};

    extern "system" fn echo_successor(arg: usize) -> usize {
        arg.wrapping_add(1)
    }

    extern "system" fn never_halts(_arg: usize) -> usize {
        loop {
            std::hint::spin_loop();
        }
    }

    #[test]
    fn invoke_returns_the_result_and_leaves_the_session_reusable() {
        let victim = Victim::spawn();
        let engine = Engine::open(EngineConfig::default());
        let mut session = engine.attach(victim.tid).unwrap();

        let first = session
            .invoke(&CallDescriptor::new(echo_successor as usize, 41))
            .unwrap();
        assert_eq!(first, 42);

        // A clean call returns the session to `Attached`.
        let second = session
            .invoke(&CallDescriptor::new(echo_successor as usize, 7))
            .unwrap();
        assert_eq!(second, 8);

        session.detach().unwrap();
        victim.finish();
    }

    #[test]
    fn timeout_poisons_the_session_for_further_calls() {
        let victim = Victim::spawn();
        let engine = Engine::open(EngineConfig {
            call_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let mut session = engine.attach(victim.tid).unwrap();

        let err = session
            .invoke(&CallDescriptor::new(never_halts as usize, 0))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(err.is_fatal());

        // Once a fatal error poisons the session, only teardown remains.
        let err = session
            .invoke(&CallDescriptor::new(echo_successor as usize, 1))
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)));

        // The saved context was put back at the timeout, so the victim still
        // winds down normally after teardown resumes it.
        session.detach().unwrap();
        victim.finish();
    }
}
