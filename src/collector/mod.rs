// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub(crate) mod backtrace_capture;
pub(crate) mod crash_handler;
pub(crate) mod emitters;
pub(crate) mod signal_handler_manager;
pub(crate) mod thread_registry;
