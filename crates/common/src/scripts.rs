//! Atomic claim/requeue/cancel Lua scripts (§4.2, §5).
//!
//! These are data, not I/O: both `jobmesh-hub` (submission/cancel surface)
//! and `jobmesh-worker` (claim/requeue) load the same script source via
//! `redis::Script`, so the atomicity contract stays byte-identical across
//! the two binaries instead of drifting into two hand-maintained copies.
//!
//! The claim script bounds its scan of `jobs:pending` at `max_scan` entries
//! (passed as an argument) rather than walking the whole sorted set, since
//! Lua inside Redis has no way to express the capability predicate as a
//! native `ZRANGEBYSCORE` filter. A worker fleet with more than `max_scan`
//! simultaneously pending, mutually-incompatible jobs ahead of its own match
//! will fail to claim until older entries drain; callers size `max_scan` to
//! their expected queue depth.

/// KEYS[1] = `jobs:pending`
/// ARGV[1] = worker_id
/// ARGV[2] = capabilities JSON: `{services:[..], hardware:{..}, isolation:{mode,allowed,denied}, region, tags:[..], concurrent_jobs}`
/// ARGV[3] = now_ms
/// ARGV[4] = max_scan
///
/// Returns the claimed job_id (string) or `false` if nothing matched.
pub const CLAIM_JOB: &str = r#"
local pending_key = KEYS[1]
local worker_id = ARGV[1]
local caps = cjson.decode(ARGV[2])
local now_ms = ARGV[3]
local max_scan = tonumber(ARGV[4])

if caps.concurrent_jobs ~= 1 then
  return false
end

local ids = redis.call('ZRANGE', pending_key, 0, max_scan - 1)
for _, job_id in ipairs(ids) do
  local job_key = 'job:' .. job_id
  local service = redis.call('HGET', job_key, 'service_required')
  if service then
    local matches = false
    for _, s in ipairs(caps.services or {}) do
      if s == service then matches = true end
    end

    if matches then
      local hw_json = redis.call('HGET', job_key, 'requirements_hardware')
      if hw_json and hw_json ~= '' and hw_json ~= '{}' then
        local hw = cjson.decode(hw_json)
        for k, v in pairs(hw) do
          local avail = caps.hardware and caps.hardware[k]
          if type(v) == 'number' then
            if avail == nil or tonumber(avail) == nil or tonumber(avail) < v then
              matches = false
            end
          else
            if avail == nil or avail ~= v then
              matches = false
            end
          end
        end
      end
    end

    if matches then
      local customer_id = redis.call('HGET', job_key, 'customer_id')
      local mode = (caps.isolation and caps.isolation.mode) or 'none'
      if mode == 'strict' then
        if not customer_id or customer_id == '' then
          matches = false
        else
          local allowed = false
          for _, a in ipairs((caps.isolation and caps.isolation.allowed) or {}) do
            if a == customer_id then allowed = true end
          end
          local denied = false
          for _, d in ipairs((caps.isolation and caps.isolation.denied) or {}) do
            if d == customer_id then denied = true end
          end
          if (not allowed) or denied then matches = false end
        end
      elseif mode == 'loose' then
        if customer_id and customer_id ~= '' then
          for _, d in ipairs((caps.isolation and caps.isolation.denied) or {}) do
            if d == customer_id then matches = false end
          end
        end
      end
    end

    if matches then
      local region = redis.call('HGET', job_key, 'requirements_region')
      if region and region ~= '' then
        if caps.region ~= region then matches = false end
      end
      local tags_json = redis.call('HGET', job_key, 'requirements_compliance_tags')
      if tags_json and tags_json ~= '' and tags_json ~= '[]' then
        local tags = cjson.decode(tags_json)
        local worker_tags = {}
        for _, t in ipairs(caps.tags or {}) do worker_tags[t] = true end
        for _, t in ipairs(tags) do
          if not worker_tags[t] then matches = false end
        end
      end
    end

    if matches then
      redis.call('ZREM', pending_key, job_id)
      redis.call('HSET', job_key, 'status', 'assigned', 'assigned_worker', worker_id, 'assigned_at_ms', now_ms)
      redis.call('HSET', 'jobs:active:' .. worker_id, job_id, '1')
      return job_id
    end
  end
end
return false
"#;

/// KEYS[1] = `jobs:pending`, KEYS[2] = `job:{id}`, KEYS[3] = `jobs:active:{worker_id}`
/// ARGV[1] = job_id, ARGV[2] = new pending-queue score, ARGV[3] = now_ms
///
/// Returns `true` on success, `false` if the job no longer exists.
pub const REQUEUE_JOB: &str = r#"
local job_key = KEYS[2]
local active_key = KEYS[3]
local job_id = ARGV[1]

local exists = redis.call('HGET', job_key, 'id')
if not exists or exists == '' then
  return false
end

redis.call('HDEL', active_key, job_id)
redis.call('HSET', job_key, 'status', 'pending', 'assigned_worker', '')
redis.call('HINCRBY', job_key, 'retry_count', 1)
redis.call('ZADD', KEYS[1], ARGV[2], job_id)
return true
"#;

/// KEYS[1] = `jobs:pending`, KEYS[2] = `job:{id}`
/// ARGV[1] = job_id
///
/// Returns the job's prior status (string), or `false` if it doesn't exist.
/// The caller inspects the prior status to decide whether to push a `cancel`
/// command onto the assigned worker's command stream.
pub const CANCEL_JOB: &str = r#"
local job_key = KEYS[2]
local job_id = ARGV[1]

local status = redis.call('HGET', job_key, 'status')
if not status or status == '' then
  return false
end

redis.call('ZREM', KEYS[1], job_id)
redis.call('HSET', job_key, 'status', 'cancelled')
return status
"#;

/// KEYS[1] = `job:{id}`
/// ARGV[1] = expected worker_id
///
/// Atomically marks a job `completed` only if it is still assigned to the
/// calling worker, guarding against a stale worker racing a sweeper-recovered
/// job. Returns `true`/`false`.
pub const COMPLETE_JOB: &str = r#"
local job_key = KEYS[1]
local worker_id = ARGV[1]
local assigned = redis.call('HGET', job_key, 'assigned_worker')
if assigned ~= worker_id then
  return false
end
redis.call('HSET', job_key, 'status', 'completed')
return true
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_are_non_empty_lua_source() {
        for src in [CLAIM_JOB, REQUEUE_JOB, CANCEL_JOB, COMPLETE_JOB] {
            assert!(src.contains("redis.call"));
        }
    }
}
